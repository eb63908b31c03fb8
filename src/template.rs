// Rendering of configuration files, scripts and task manifests.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::Error;

/// Extension of a template that stands in for a missing plain file.
pub const TEMPLATE_EXT: &str = "hbs";

/// Strict registry that leaves rendered text unescaped. Scripts and config
/// files are not HTML.
fn registry() -> Handlebars<'static> {
    let mut reg = Handlebars::new();
    reg.set_strict_mode(true);
    reg.register_escape_fn(handlebars::no_escape);
    reg
}

/// Renders a template string. Referencing an undefined variable is an error.
pub fn render_str<V: Serialize>(tpl: &str, vars: &V) -> Result<String, Error> {
    let reg = registry();
    reg.render_template(tpl, vars).map_err(Error::from)
}

/// Renders the template file at `path`.
pub fn render_file<P: AsRef<Path>, V: Serialize>(path: P, vars: &V) -> Result<String, Error> {
    let path = path.as_ref();
    let name = path.display().to_string();
    log::debug!("Rendering template {name}");

    let mut reg = registry();
    reg.register_template_file(&name, path)
        .inspect_err(|e| log::error!("Could not load template {name}: {e}"))?;
    reg.render(&name, vars)
        .inspect_err(|e| log::error!("Could not render template {name}: {e}"))
        .map_err(Error::from)
}

/// Renders the template file at `path` into a temporary file under `dir`.
/// The file is removed when the returned handle is dropped.
pub fn render_to_tempfile<P: AsRef<Path>, V: Serialize>(
    path: P,
    vars: &V,
    dir: &Path,
) -> Result<NamedTempFile, Error> {
    use std::io::Write;

    let body = render_file(path, vars)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.flush()?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;
    use std::collections::BTreeMap;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("domain".to_string(), "example.com".to_string()),
            ("port".to_string(), "8080".to_string()),
        ])
    }

    #[test]
    fn test_render_str() {
        assert_that!(render_str("listen {{port}};", &vars())).has_value("listen 8080;");
    }

    #[test]
    fn test_render_does_not_escape() {
        assert_that!(render_str("echo \"{{domain}}\" > /tmp/<x>", &vars()))
            .has_value("echo \"example.com\" > /tmp/<x>");
    }

    #[test]
    fn test_render_strict() {
        assert_that!(render_str("{{missing}}", &vars())).is_err();
    }

    #[test]
    fn test_render_to_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = dir.path().join("nginx.conf.hbs");
        std::fs::write(&tpl, "server_name {{domain}};\n").unwrap();

        let tmp = render_to_tempfile(&tpl, &vars(), dir.path()).unwrap();
        assert_that!(tmp.path().starts_with(dir.path())).is_true();
        assert_that!(std::fs::read_to_string(tmp.path()).unwrap())
            .is_equal_to("server_name example.com;\n");
    }
}
