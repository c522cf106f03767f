use anyhow::Context;
use std::str::FromStr;

/// Read an environment variable, treating an empty value as unset.
pub fn env_get_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse `raw` into `T`, naming `key` and the expected type on failure.
pub fn parse_var<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("{err}"))
        .with_context(|| {
            format!(
                "invalid value `{raw}` for ${key}, expect type: {}",
                std::any::type_name::<T>()
            )
        })
}

#[test]
fn parse_var_reports_key() {
    assert_eq!(parse_var::<u16>("PORT", " 8080 ").unwrap(), 8080);

    let err = parse_var::<u16>("PORT", "eighty").unwrap_err();
    assert!(format!("{err:#}").contains("$PORT"));
}
