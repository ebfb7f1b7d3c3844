use std::fmt;
use std::str::FromStr;

use base64_light::base64_decode;
use log::error;
use uuid::Uuid;

/// Credentials pulled out of a `Basic` authorization header.
pub struct Credentials {
    user: String,
    pass: String,
}

impl FromStr for Credentials {
    type Err = &'static str;

    fn from_str(header: &str) -> Result<Self, Self::Err> {
        let (basic, auth_b64) = header
            .split_once(' ')
            .ok_or("no space in auth header")?;

        if basic != "Basic" {
            return Err("only basic auth supported");
        }

        let auth_bytes = base64_decode(auth_b64);
        let auth = std::str::from_utf8(&auth_bytes)
            .map_err(|e| {
                error!("invalid utf-8 for password: {e:?}");
                "non-utf8 in auth header"
            })?;

        let (user, pass) = auth.split_once(':')
            .ok_or("no colon in auth value")?;

        let user = user.into();
        let pass = pass.into();

        Ok(Self { user, pass })
    }
}

impl Credentials {
    pub fn user(&self) -> &str { &self.user }
    pub fn pass(&self) -> &str { &self.pass }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s).map(Self).map_err(|_| ())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}
