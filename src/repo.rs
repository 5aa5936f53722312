//! Repository locator parsing.
//!
//! Callers identify a repository by whatever string they have at hand; the
//! raw string is what gets bound into a preview token, while the parsed
//! `owner/repo` pair drives credentials, cloning, and API calls.

use std::fmt;

/// A GitHub repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parse `owner/repo` out of the supported locator formats:
    /// - `owner/repo`
    /// - `https://github.com/owner/repo` (optionally `.git`, trailing slash)
    /// - `github.com/owner/repo`
    /// - `git@github.com:owner/repo.git`
    pub fn parse(locator: &str) -> Option<Self> {
        let url = locator
            .trim()
            .trim_end_matches('/')
            .trim_end_matches(".git");

        let rest = if let Some(pos) = url.find("github.com/") {
            &url[pos + "github.com/".len()..]
        } else if let Some(rest) = url.strip_prefix("git@github.com:") {
            rest
        } else if url.contains("://") || url.contains('@') {
            return None;
        } else {
            url
        };

        let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != 2 {
            return None;
        }
        let (owner, name) = (parts[0], parts[1]);
        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Clone URL under the given base (`https://github.com` in production,
    /// a `file://` directory in tests).
    pub fn clone_url(&self, clone_base: &str) -> String {
        format!(
            "{}/{}/{}.git",
            clone_base.trim_end_matches('/'),
            self.owner,
            self.name
        )
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(s: &str) -> Option<String> {
        RepoRef::parse(s).map(|r| r.to_string())
    }

    #[test]
    fn test_parse_bare_owner_repo() {
        assert_eq!(parsed("acme/app"), Some("acme/app".into()));
    }

    #[test]
    fn test_parse_https_url() {
        assert_eq!(parsed("https://github.com/acme/app"), Some("acme/app".into()));
        assert_eq!(parsed("https://github.com/acme/app.git"), Some("acme/app".into()));
        assert_eq!(parsed("https://github.com/acme/app/"), Some("acme/app".into()));
    }

    #[test]
    fn test_parse_schemeless_url() {
        assert_eq!(parsed("github.com/acme/app"), Some("acme/app".into()));
    }

    #[test]
    fn test_parse_ssh_url() {
        assert_eq!(parsed("git@github.com:acme/app.git"), Some("acme/app".into()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parsed(""), None);
        assert_eq!(parsed("acme"), None);
        assert_eq!(parsed("acme/app/extra"), None);
        assert_eq!(parsed("https://gitlab.com/acme/app"), None);
        assert_eq!(parsed("acme/app; rm -rf /"), None);
        assert_eq!(parsed("../app"), None);
    }

    #[test]
    fn test_clone_url() {
        let repo = RepoRef::parse("acme/app").unwrap();
        assert_eq!(
            repo.clone_url("https://github.com/"),
            "https://github.com/acme/app.git"
        );
        assert_eq!(
            repo.clone_url("file:///tmp/remotes"),
            "file:///tmp/remotes/acme/app.git"
        );
    }
}
