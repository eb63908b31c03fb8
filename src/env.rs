/// Build information baked in at compile time.
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Returns "<name> <version>", used in user agent headers and page footers.
pub fn version_string() -> String {
    format!("{NAME} {VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_version_string() {
        assert_that!(version_string()).starts_with("axis ");
        assert_that!(version_string()).ends_with(VERSION);
    }
}
