use common::error::SyncError;

/// `[user@]host:dir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub user: Option<String>,
    /// Host name or address, without brackets.
    pub host: String,
    pub path: String,
}

impl RemotePath {
    /// `[user@]host`, as handed to the remote shell.
    #[must_use]
    pub fn login(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.path)
        } else {
            write!(f, "{}:{}", self.host, self.path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(std::path::PathBuf),
    Remote(RemotePath),
}

/// Splits a command-line endpoint into a local directory or a remote one.
///
/// Anything of the form `[user@]host:dir` is remote, where `host` contains no
/// `/` (so `./a:b` stays local) and may be bracketed (`[fe80::1]:dir`).
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, SyncError> {
    let re = regex::Regex::new(
        r"^(?:(?P<user>[^@/:\[\]]+)@)?(?P<host>\[[^\]]+\]|[^:\[\]/@]+):(?P<path>.*)$",
    )
    .map_err(|error| SyncError::config(error.to_string()))?;
    let Some(captures) = re.captures(endpoint) else {
        return Ok(Endpoint::Local(endpoint.into()));
    };
    let user = captures.name("user").map(|m| m.as_str().to_string());
    let host = captures
        .name("host")
        .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or_default()
        .to_string();
    let path = captures.name("path").map(|m| m.as_str()).unwrap_or_default();
    if host.is_empty() {
        return Err(SyncError::config(format!("{endpoint:?} names no host")));
    }
    if path.is_empty() {
        return Err(SyncError::config(format!("{endpoint:?} names no directory")));
    }
    Ok(Endpoint::Remote(RemotePath {
        user,
        host,
        path: path.to_string(),
    }))
}
