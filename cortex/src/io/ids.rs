//! Run id generation.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;

const SUFFIX_LEN: usize = 6;

/// `run_<YYYYMMDDTHHMMSSZ>_<6 lowercase alphanumerics>`.
pub fn generate_run_id() -> String {
    run_id_at(Utc::now(), &mut rand::thread_rng())
}

fn run_id_at(now: DateTime<Utc>, rng: &mut impl Rng) -> String {
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .map(|b| char::from(b).to_ascii_lowercase())
        .take(SUFFIX_LEN)
        .collect();
    format!("run_{}_{suffix}", now.format("%Y%m%dT%H%M%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn id_has_timestamp_and_lowercase_suffix() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).single().expect("time");
        let id = run_id_at(now, &mut StdRng::seed_from_u64(7));
        assert!(id.starts_with("run_20250309T140507Z_"), "{id}");
        let suffix = id.rsplit('_').next().expect("suffix");
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
