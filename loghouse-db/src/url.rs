use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::path::PathBuf;

/// Build the ClickHouse HTTP endpoint from `CLICKHOUSE_*` environment
/// variables. Credentials travel as URL userinfo, which the HTTP client
/// turns into basic auth.
pub fn clickhouse_url_from_environment() -> String {
    #[derive(Debug, PartialEq, Deserialize)]
    struct ClickHouseConfig {
        user: String,
        password: Option<String>,
        password_file: Option<PathBuf>,
        host: String,
        db: String,
    }
    let provider = figment::providers::Env::prefixed("CLICKHOUSE_");
    let config: ClickHouseConfig = figment::Figment::from(provider)
        .extract()
        .expect("ClickHouse configuration environment variable(s) missing or invalid");

    let password = resolve_password(config.password, config.password_file, "CLICKHOUSE");

    // Must percent encode the password so it survives embedding in a URL
    let password = utf8_percent_encode(&password, NON_ALPHANUMERIC);

    format!(
        "http://{}:{}@{}/?database={}",
        config.user, password, config.host, config.db
    )
}

/// Build the Redis connection URL from `REDIS_*` environment variables.
/// `REDIS_URL` wins when present; otherwise the URL is composed from parts.
pub fn redis_url_from_environment() -> String {
    #[derive(Debug, PartialEq, Deserialize)]
    struct RedisConfig {
        url: Option<String>,
        host: Option<String>,
        password: Option<String>,
        password_file: Option<PathBuf>,
        db: Option<u32>,
    }
    let provider = figment::providers::Env::prefixed("REDIS_");
    let config: RedisConfig = figment::Figment::from(provider)
        .extract()
        .expect("Redis configuration environment variable(s) invalid");

    if let Some(url) = config.url {
        return url;
    }

    let host = config
        .host
        .unwrap_or_else(|| "127.0.0.1:6379".to_string());
    let db = config.db.unwrap_or(0);

    if config.password.is_none() && config.password_file.is_none() {
        return format!("redis://{host}/{db}");
    }

    let password = resolve_password(config.password, config.password_file, "REDIS");
    let password = utf8_percent_encode(&password, NON_ALPHANUMERIC);
    format!("redis://:{password}@{host}/{db}")
}

fn resolve_password(
    password: Option<String>,
    password_file: Option<PathBuf>,
    prefix: &str,
) -> String {
    let password = if let Some(password) = password {
        password
    } else if let Some(password_file) = password_file {
        std::fs::read_to_string(password_file)
            .unwrap_or_else(|_| panic!("Failed to read {prefix} password file"))
    } else {
        panic!("One of {prefix}_PASSWORD or {prefix}_PASSWORD_FILE must be provided");
    };

    // A trailing newline is such a strong file convention that the operator
    // might not realize they have one; trim it. Any other newline would be
    // silently truncated somewhere downstream, so refuse it outright.
    let password = password
        .strip_suffix('\n')
        .map(str::to_string)
        .unwrap_or(password);

    if password.contains('\n') {
        panic!(
            "{prefix} password contains a non-terminal newline and would be insecurely \
            truncated. Please try again with a password that does not contain non-terminal \
            newlines."
        );
    }

    password
}
