use std::{env, fmt::Display, net::SocketAddr, str::FromStr};

use tracing::{info, warn};

use crate::cloudinary::CloudinaryCredentials;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub enum JwtKeys {
    /// Base64 encoded RSA PEM pair, signed with RS256.
    Rsa { private_pem: String, public_pem: String },
    Hmac(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mongodb_uri: String,
    pub database_name: String,
    pub bind_addr: SocketAddr,
    pub public_dir: String,
    pub jwt: JwtKeys,
    pub cloudinary: Option<CloudinaryCredentials>,
    pub payment_retention_months: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            mongodb_uri: required("MONGODB_URI")?,
            database_name: try_load("DATABASE_NAME", "gym")?,
            bind_addr: try_load("BIND_ADDR", "0.0.0.0:8080")?,
            public_dir: try_load("PUBLIC_DIR", "public")?,
            jwt: jwt_keys()?,
            cloudinary: cloudinary()?,
            payment_retention_months: retention_months()?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|it| !it.trim().is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    var(key).ok_or(ConfigError::Missing(key))
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|err: T::Err| {
            warn!("Invalid {key} value: {err}");
            ConfigError::Invalid {
                key,
                reason: err.to_string(),
            }
        })
}

pub const MAX_RETENTION_MONTHS: i64 = 1200;

fn retention_months() -> Result<i64, ConfigError> {
    let months: i64 = try_load("PAYMENT_RETENTION_MONTHS", "12")?;

    if !(1..=MAX_RETENTION_MONTHS).contains(&months) {
        warn!("PAYMENT_RETENTION_MONTHS out of range: {months}");
        return Err(ConfigError::Invalid {
            key: "PAYMENT_RETENTION_MONTHS",
            reason: format!("must be between 1 and {MAX_RETENTION_MONTHS}"),
        });
    }

    Ok(months)
}

fn jwt_keys() -> Result<JwtKeys, ConfigError> {
    match (var("JWT_SECRET_KEY"), var("JWT_PUBLIC_KEY")) {
        (Some(private_pem), Some(public_pem)) => Ok(JwtKeys::Rsa {
            private_pem,
            public_pem,
        }),
        (Some(_), None) => Err(ConfigError::Missing("JWT_PUBLIC_KEY")),
        (None, Some(_)) => Err(ConfigError::Missing("JWT_SECRET_KEY")),
        (None, None) => {
            info!("RSA keys not set, signing tokens with JWT_HMAC_SECRET");
            required("JWT_HMAC_SECRET").map(JwtKeys::Hmac)
        }
    }
}

fn cloudinary() -> Result<Option<CloudinaryCredentials>, ConfigError> {
    let Some(cloud_name) = var("CLOUDINARY_CLOUD_NAME") else {
        warn!("CLOUDINARY_CLOUD_NAME not set, profile image upload disabled");
        return Ok(None);
    };

    Ok(Some(CloudinaryCredentials {
        cloud_name,
        api_key: required("CLOUDINARY_API_KEY")?,
        api_secret: required("CLOUDINARY_API_SECRET")?,
        folder: try_load("CLOUDINARY_FOLDER", "gym/profiles")?,
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_try_load() {
        let months: i64 = try_load("GYM_TEST_UNSET_RETENTION", "12").unwrap();
        assert_eq!(months, 12);

        env::set_var("GYM_TEST_BAD_RETENTION", "twelve");
        assert_matches!(
            try_load::<i64>("GYM_TEST_BAD_RETENTION", "12"),
            Err(ConfigError::Invalid {
                key: "GYM_TEST_BAD_RETENTION",
                ..
            })
        );

        env::set_var("GYM_TEST_BLANK", "  ");
        assert_eq!(var("GYM_TEST_BLANK"), None);
    }

    #[test]
    fn test_retention_months_is_bounded() {
        env::set_var("PAYMENT_RETENTION_MONTHS", "99999999999999");
        assert_matches!(
            retention_months(),
            Err(ConfigError::Invalid {
                key: "PAYMENT_RETENTION_MONTHS",
                ..
            })
        );

        env::set_var("PAYMENT_RETENTION_MONTHS", "0");
        assert_matches!(retention_months(), Err(ConfigError::Invalid { .. }));

        env::set_var("PAYMENT_RETENTION_MONTHS", "24");
        assert_eq!(retention_months().unwrap(), 24);
    }

    #[test]
    fn test_required() {
        assert_matches!(
            required("GYM_TEST_UNSET_REQUIRED"),
            Err(ConfigError::Missing("GYM_TEST_UNSET_REQUIRED"))
        );
    }
}
