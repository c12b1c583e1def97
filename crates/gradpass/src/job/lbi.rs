use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one tensor by its producing operator and output blob name.
///
/// Serialized as the logical blob name `"op_name/blob_name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalBlobId {
    pub op_name: String,
    pub blob_name: String,
}

impl LogicalBlobId {
    pub fn new(op_name: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            blob_name: blob_name.into(),
        }
    }

    /// Parses a logical blob name of the form `op_name/blob_name`.
    pub fn parse(lbn: &str) -> Result<Self, LbnParseError> {
        let (op_name, blob_name) = lbn
            .split_once('/')
            .ok_or_else(|| LbnParseError::new(lbn))?;
        if op_name.is_empty() || blob_name.is_empty() || blob_name.contains('/') {
            return Err(LbnParseError::new(lbn));
        }
        Ok(Self::new(op_name, blob_name))
    }

    pub fn lbn(&self) -> String {
        format!("{}/{}", self.op_name, self.blob_name)
    }
}

impl fmt::Display for LogicalBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op_name, self.blob_name)
    }
}

impl Serialize for LogicalBlobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.lbn())
    }
}

impl<'de> Deserialize<'de> for LogicalBlobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let lbn = String::deserialize(deserializer)?;
        LogicalBlobId::parse(&lbn).map_err(serde::de::Error::custom)
    }
}

/// Identifies one input or output port of one operator.
///
/// Serialized as `"op_name:bn_in_op"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpBlobArg {
    pub op_name: String,
    pub bn_in_op: String,
}

impl OpBlobArg {
    pub fn new(op_name: impl Into<String>, bn_in_op: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            bn_in_op: bn_in_op.into(),
        }
    }
}

impl fmt::Display for OpBlobArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.op_name, self.bn_in_op)
    }
}

impl Serialize for OpBlobArg {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OpBlobArg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let (op_name, bn_in_op) = text
            .split_once(':')
            .ok_or_else(|| serde::de::Error::custom(format!("invalid op blob arg {text:?}")))?;
        Ok(OpBlobArg::new(op_name, bn_in_op))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbiPair {
    pub first: LogicalBlobId,
    pub second: LogicalBlobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpBlobArgPair {
    pub first: OpBlobArg,
    pub second: OpBlobArg,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid logical blob name {lbn:?} (expected \"op_name/blob_name\")")]
pub struct LbnParseError {
    lbn: String,
}

impl LbnParseError {
    fn new(lbn: &str) -> Self {
        Self {
            lbn: lbn.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(LogicalBlobId::parse("fc_out").is_err());
        assert!(LogicalBlobId::parse("/out").is_err());
        assert!(LogicalBlobId::parse("fc/out/extra").is_err());
    }

    #[test]
    fn lbi_serializes_as_lbn_string() {
        let lbi = LogicalBlobId::new("fc", "out");
        let json = serde_json::to_string(&lbi).expect("serialize lbi");
        assert_eq!(json, "\"fc/out\"");
        let back: LogicalBlobId = serde_json::from_str(&json).expect("deserialize lbi");
        assert_eq!(back, lbi);
    }

    #[test]
    fn oba_serializes_with_colon() {
        let oba = OpBlobArg::new("mul", "x");
        let json = serde_json::to_string(&oba).expect("serialize oba");
        assert_eq!(json, "\"mul:x\"");
    }
}
