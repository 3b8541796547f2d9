//! Name generation for objects created with `generate_name`.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Longest name a generator may produce.
pub const MAX_NAME_LENGTH: usize = 63;

const RANDOM_LENGTH: usize = 5;
const MAX_GENERATED_NAME_LENGTH: usize = MAX_NAME_LENGTH - RANDOM_LENGTH;

/// Produces a unique-enough name from a base prefix.
pub trait NameGenerator: Send + Sync {
    fn generate_name(&self, base: &str) -> String;
}

/// Appends five random lowercase alphanumerics to the base, truncating the
/// base so the result stays within [`MAX_NAME_LENGTH`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleNameGenerator;

impl NameGenerator for SimpleNameGenerator {
    fn generate_name(&self, base: &str) -> String {
        let mut end = base.len().min(MAX_GENERATED_NAME_LENGTH);
        while !base.is_char_boundary(end) {
            end -= 1;
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_LENGTH)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        format!("{}{}", &base[..end], suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_name() {
        let name = SimpleNameGenerator.generate_name("foo");
        assert!(name.starts_with("foo"));
        assert_ne!(name, "foo");
        assert_eq!(name.len(), 3 + RANDOM_LENGTH);
    }

    #[test]
    fn test_generate_name_truncates_base() {
        let base = "x".repeat(100);
        let name = SimpleNameGenerator.generate_name(&base);
        assert_eq!(name.len(), MAX_NAME_LENGTH);
        assert!(name.starts_with(&"x".repeat(MAX_GENERATED_NAME_LENGTH)));
    }
}
