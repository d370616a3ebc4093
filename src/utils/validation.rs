use crate::utils::error::{EtlError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(EtlError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: url_str.to_string(),
                reason: format!("Unsupported URL scheme: {}", scheme),
            }),
        },
        Err(e) => Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.contains('\0') {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path contains null bytes".to_string(),
        });
    }

    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

/// Credentials are never printed back in the error.
pub fn validate_secret(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EtlError::MissingConfigError {
            field: field_name.to_string(),
        });
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| EtlError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

/// 表名/欄位名會直接拼進 SQL，只接受 `schema.table` 形式的簡單識別字
pub fn validate_sql_identifier(field_name: &str, value: &str) -> Result<()> {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let re = IDENT.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier pattern is valid")
    });

    if !re.is_match(value) {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Expected a plain identifier such as schema.table".to_string(),
        });
    }
    Ok(())
}

pub fn validate_unique_names<'a>(
    field_name: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(EtlError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: name.to_string(),
                reason: "Duplicate name".to_string(),
            });
        }
    }
    Ok(())
}

pub fn validate_s3_bucket_name(field_name: &str, bucket_name: &str) -> Result<()> {
    if bucket_name.len() < 3 || bucket_name.len() > 63 {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: bucket_name.to_string(),
            reason: "S3 bucket name must be between 3 and 63 characters".to_string(),
        });
    }

    if !bucket_name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: bucket_name.to_string(),
            reason: "S3 bucket name can only contain lowercase letters, numbers, hyphens, and dots"
                .to_string(),
        });
    }

    if bucket_name.starts_with('-') || bucket_name.ends_with('-') {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: bucket_name.to_string(),
            reason: "S3 bucket name cannot start or end with a hyphen".to_string(),
        });
    }

    Ok(())
}

pub fn validate_aws_region(field_name: &str, region: &str) -> Result<()> {
    validate_non_empty_string(field_name, region)?;

    if !region
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(EtlError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: region.to_string(),
            reason: "AWS region can only contain lowercase letters, numbers, and hyphens"
                .to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("source.base_url", "https://acme.zendesk.com").is_ok());
        assert!(validate_url("source.base_url", "http://localhost:8080").is_ok());
        assert!(validate_url("source.base_url", "").is_err());
        assert!(validate_url("source.base_url", "invalid-url").is_err());
        assert!(validate_url("source.base_url", "ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_sql_identifier() {
        assert!(validate_sql_identifier("target.table", "zendesk.tickets").is_ok());
        assert!(validate_sql_identifier("target.table", "leads").is_ok());
        assert!(validate_sql_identifier("target.table", "zendesk.tickets; DROP").is_err());
        assert!(validate_sql_identifier("target.table", "a.b.c").is_err());
        assert!(validate_sql_identifier("target.table", "1table").is_err());
    }

    #[test]
    fn test_validate_s3_bucket_name() {
        assert!(validate_s3_bucket_name("object_store.bucket", "json-repository").is_ok());
        assert!(validate_s3_bucket_name("object_store.bucket", "ab").is_err());
        assert!(validate_s3_bucket_name("object_store.bucket", "Upper_Case").is_err());
        assert!(validate_s3_bucket_name("object_store.bucket", "-leading").is_err());
    }

    #[test]
    fn test_validate_unique_names() {
        assert!(validate_unique_names("pipelines.name", ["a", "b"]).is_ok());
        assert!(validate_unique_names("pipelines.name", ["a", "a"]).is_err());
    }

    #[test]
    fn test_validate_secret_hides_value() {
        let err = validate_secret("source.token", "  ").unwrap_err();
        assert!(matches!(err, EtlError::MissingConfigError { .. }));
    }
}
