// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cloud target identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error parsing a fully-qualified table name.
#[derive(Debug, Clone, Error)]
pub enum TableNameError {
    #[error("table name must be catalog.schema.table, found {0} parts")]
    WrongPartCount(usize),
    #[error("table name part {0:?} is empty or contains whitespace")]
    BadPart(String),
}

/// A fully-qualified `catalog.schema.table` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(catalog: &str, schema: &str, table: &str) -> Result<TableName, TableNameError> {
        for part in [catalog, schema, table] {
            if part.is_empty() || part.chars().any(char::is_whitespace) {
                return Err(TableNameError::BadPart(part.to_owned()));
            }
        }
        Ok(TableName {
            catalog: catalog.to_owned(),
            schema: schema.to_owned(),
            table: table.to_owned(),
        })
    }
}

impl FromStr for TableName {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [catalog, schema, table] => TableName::new(catalog, schema, table),
            parts => Err(TableNameError::WrongPartCount(parts.len())),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = TableNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> String {
        name.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

/// The identity of a cloud destination: the triple that must be unique
/// across all configured targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    /// Workspace host, used for token acquisition.
    pub workspace_host: String,
    /// ZeroBus ingestion endpoint host.
    pub zerobus_endpoint: String,
    /// Destination table.
    pub table: TableName,
}

impl TargetKey {
    /// A filesystem-safe rendering, used to name per-target spool
    /// subdirectories for non-default targets.
    pub fn dir_component(&self) -> String {
        let raw = format!("{}-{}-{}", self.workspace_host, self.zerobus_endpoint, self.table);
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.workspace_host, self.zerobus_endpoint, self.table)
    }
}
