use http::header::HeaderName;
use http::HeaderMap;

use crate::config::AuthConfig;
use crate::error::GatewayError;

/// The caller as established by the fronting auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Reads the verified user from trusted headers, falling back to the dev
/// user when dev mode is on.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    user_id_header: HeaderName,
    user_email_header: HeaderName,
    dev_user_id: Option<String>,
}

impl IdentityResolver {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when a configured header name is invalid.
    pub fn from_config(config: &AuthConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            user_id_header: parse_header_name(&config.user_id_header, "auth.user_id_header")?,
            user_email_header: parse_header_name(
                &config.user_email_header,
                "auth.user_email_header",
            )?,
            dev_user_id: config.dev_mode.then(|| config.dev_user_id.clone()),
        })
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Auth`] when no identity is present and dev mode
    /// is off.
    pub fn resolve(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let email = header_text(headers, &self.user_email_header).map(str::to_string);
        if let Some(user_id) = header_text(headers, &self.user_id_header) {
            return Ok(Identity {
                user_id: user_id.to_string(),
                email,
            });
        }
        match &self.dev_user_id {
            Some(user_id) => Ok(Identity {
                user_id: user_id.clone(),
                email,
            }),
            None => Err(GatewayError::Auth("Missing user identity".to_string())),
        }
    }
}

fn parse_header_name(name: &str, field: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
        .map_err(|_| GatewayError::Config(format!("{field} is not a valid header name")))
}

fn header_text<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
