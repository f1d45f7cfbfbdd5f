//! Destination identifiers

use regex::Regex;

use super::SchemaError;

/// Turns source column names into stable snake_case identifiers.
///
/// `VendorID` -> `vendor_id`, `PULocationID` -> `pu_location_id`,
/// `Airport_fee` -> `airport_fee`.
#[derive(Debug, Clone)]
pub struct ColumnNamer {
    acronym_boundary: Regex,
    word_boundary: Regex,
}

impl ColumnNamer {
    pub fn new() -> Result<Self, SchemaError> {
        Ok(Self {
            acronym_boundary: Regex::new(r"([A-Z]+)([A-Z][a-z])")?,
            word_boundary: Regex::new(r"([a-z\d])([A-Z])")?,
        })
    }

    pub fn normalize(&self, name: &str) -> String {
        let name = self.acronym_boundary.replace_all(name.trim(), "${1}_${2}");
        let name = self.word_boundary.replace_all(&name, "${1}_${2}");
        name.replace(['-', ' '], "_").to_lowercase()
    }

    /// Normalise a whole column list, rejecting names that collide afterwards.
    pub fn normalize_all<'a, I>(&self, names: I) -> Result<Vec<String>, SchemaError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for name in names {
            let column = self.normalize(name);
            if column.is_empty() {
                return Err(SchemaError::InvalidIdentifier(name.to_string()));
            }
            if normalized.contains(&column) {
                return Err(SchemaError::DuplicateColumn(column));
            }
            normalized.push(column);
        }
        Ok(normalized)
    }
}

/// Double-quote an identifier for PostgreSQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Reject identifiers PostgreSQL cannot represent.
pub fn validate_ident(ident: &str) -> Result<(), SchemaError> {
    if ident.trim().is_empty() || ident.contains('\0') {
        return Err(SchemaError::InvalidIdentifier(ident.to_string()));
    }
    Ok(())
}

/// `"schema"."table"`
pub fn qualified_name(schema: &str, table: &str) -> Result<String, SchemaError> {
    validate_ident(schema)?;
    validate_ident(table)?;
    Ok(format!("{}.{}", quote_ident(schema), quote_ident(table)))
}
