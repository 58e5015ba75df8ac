use std::fs;
use std::path::Path;

/// Login credentials consumed once at startup (§3: `{login, password}`).
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Reads a `key=value` document, one field per line. Blank lines and
    /// lines starting with `#` are ignored.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading credentials file {}: {e}", path.display()))?;

        let mut login = None;
        let mut password = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "login" => login = Some(value.trim().to_string()),
                "password" => password = Some(value.trim().to_string()),
                _ => {}
            }
        }

        Ok(Credentials {
            login: login.ok_or_else(|| anyhow::anyhow!("credentials file missing `login`"))?,
            password: password
                .ok_or_else(|| anyhow::anyhow!("credentials file missing `password`"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_login_and_password() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "login=alice\npassword=hunter2\n").unwrap();
        let creds = Credentials::load(f.path()).unwrap();
        assert_eq!(creds.login, "alice");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment\n\nlogin=bob\n\npassword=secret").unwrap();
        let creds = Credentials::load(f.path()).unwrap();
        assert_eq!(creds.login, "bob");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn missing_password_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "login=bob").unwrap();
        assert!(Credentials::load(f.path()).is_err());
    }
}
