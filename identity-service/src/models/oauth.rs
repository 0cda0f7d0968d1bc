//! Protocol value types shared by login sessions, codes and tokens.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Authentication Context Class Reference.
///
/// `Level0` means the user was recognised from an SSO session without any
/// credential check; `Level1` means a fresh credential check happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Acr {
    Level0 = 0,
    Level1 = 1,
}

impl Acr {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acr::Level0 => "0",
            Acr::Level1 => "1",
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

impl FromStr for Acr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Acr::Level0),
            "1" => Ok(Acr::Level1),
            other => Err(format!("unsupported acr value: {}", other)),
        }
    }
}

impl TryFrom<i16> for Acr {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Acr::Level0),
            1 => Ok(Acr::Level1),
            other => Err(format!("unsupported acr level: {}", other)),
        }
    }
}

impl fmt::Display for Acr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Acr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Acr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Query,
    Fragment,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Query => "query",
            ResponseMode::Fragment => "fragment",
        }
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(ResponseMode::Query),
            "fragment" => Ok(ResponseMode::Fragment),
            other => Err(format!("unsupported response_mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prompt {
    None,
    Login,
    Consent,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prompt::None => "none",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
        }
    }
}

impl FromStr for Prompt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Prompt::None),
            "login" => Ok(Prompt::Login),
            "consent" => Ok(Prompt::Consent),
            other => Err(format!("unsupported prompt: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::Plain => "plain",
            CodeChallengeMethod::S256 => "S256",
        }
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(CodeChallengeMethod::Plain),
            "S256" => Ok(CodeChallengeMethod::S256),
            other => Err(format!("unsupported code_challenge_method: {}", other)),
        }
    }
}

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_EMAIL: &str = "email";

pub const SUPPORTED_SCOPES: &[&str] =
    &[SCOPE_OPENID, SCOPE_OFFLINE_ACCESS, SCOPE_PROFILE, SCOPE_EMAIL];

/// Split a space-delimited scope parameter, dropping duplicates but keeping order.
pub fn parse_scope(raw: &str) -> Vec<String> {
    let mut scope: Vec<String> = Vec::new();
    for value in raw.split(' ').filter(|v| !v.is_empty()) {
        if !scope.iter().any(|s| s == value) {
            scope.push(value.to_string());
        }
    }
    scope
}

pub fn scope_contains(scope: &[String], value: &str) -> bool {
    scope.iter().any(|s| s == value)
}

pub fn is_subset(requested: &[String], granted: &[String]) -> bool {
    requested.iter().all(|s| scope_contains(granted, s))
}
