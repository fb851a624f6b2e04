use url::Url;

use crate::error::Error;

/// The port gearmand listens on unless told otherwise.
pub(crate) const DEFAULT_PORT: u16 = 4730;

pub(crate) fn get_env_url() -> String {
    use std::env;
    let var = env::var("GEARMAN_PROVIDER").unwrap_or_else(|_| "GEARMAN_URL".to_string());
    env::var(var).unwrap_or_else(|_| "tcp://localhost:4730".to_string())
}

pub(crate) fn env_namespace() -> Option<Vec<u8>> {
    std::env::var("GEARMAN_NAMESPACE").ok().map(String::into_bytes)
}

/// Parse a `tcp://host[:port]` server address into host and port.
pub(crate) fn parse_server(url: &str) -> Result<(String, u16), Error> {
    let url = Url::parse(url)
        .map_err(|e| Error::invalid(format!("bad server url {:?}: {}", url, e)))?;
    if url.scheme() != "tcp" {
        return Err(Error::invalid(format!("unknown scheme '{}'", url.scheme())));
    }
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return Err(Error::invalid("no hostname given")),
    };
    Ok((host, url.port().unwrap_or(DEFAULT_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_env_parsing() {
        use std::env;

        if env::var_os("GEARMAN_URL").is_some() || env::var_os("GEARMAN_PROVIDER").is_some() {
            eprintln!("skipping test to avoid messing with user-set GEARMAN_URL");
            return;
        }

        assert_eq!(get_env_url(), "tcp://localhost:4730");

        env::set_var("GEARMAN_URL", "tcp://example.com:7500");
        assert_eq!(get_env_url(), "tcp://example.com:7500");

        env::set_var("GEARMAN_PROVIDER", "URL");
        env::set_var("URL", "tcp://example.com:7501");
        assert_eq!(get_env_url(), "tcp://example.com:7501");

        env::remove_var("GEARMAN_PROVIDER");
        env::remove_var("GEARMAN_URL");
        env::remove_var("URL");
    }

    #[test]
    fn port_defaults() {
        assert_eq!(parse_server("tcp://example.com").unwrap(), ("example.com".into(), 4730));
        assert_eq!(
            parse_server("tcp://example.com:7070").unwrap(),
            ("example.com".into(), 7070)
        );
    }

    #[test]
    fn requires_tcp_scheme() {
        assert!(parse_server("gear://example.com").is_err());
        assert!(parse_server("example.com:4730").is_err());
    }

    #[test]
    fn requires_host() {
        assert!(parse_server("tcp://:4730").is_err());
    }
}
