// ABOUTME: Stable string hashing for advisory-lock keys and column/property remapping
// ABOUTME: TableDescriptor carries the bidirectional column-name/property-name maps per table

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Stable 31-bit non-negative hash of a string.
///
/// Folds UTF-16 code units with `h = h * 31 + unit` in wrapping 32-bit
/// arithmetic, then reduces `|h|` modulo `2^31 - 1`. Total on all strings
/// (including the empty string, which hashes to 0), pure, and stable across
/// processes and restarts, so every instance derives the same advisory-lock
/// id from the same key.
pub fn stable_hash(input: &str) -> i64 {
    let mut h: i32 = 0;
    for unit in input.encode_utf16() {
        h = h
            .wrapping_shl(5)
            .wrapping_sub(h)
            .wrapping_add(i32::from(unit));
    }
    i64::from(h.unsigned_abs()) % ((1i64 << 31) - 1)
}

/// Derive the default property name for a database column.
///
/// Columns follow snake_case in the database while handler payloads use
/// camelCase properties: `created_at` becomes `createdAt`. Columns without
/// underscores pass through unchanged.
pub fn column_to_property(column: &str) -> String {
    let mut property = String::with_capacity(column.len());
    let mut uppercase_next = false;
    for ch in column.chars() {
        if ch == '_' {
            uppercase_next = true;
        } else if uppercase_next {
            property.extend(ch.to_uppercase());
            uppercase_next = false;
        } else {
            property.push(ch);
        }
    }
    property
}

/// Metadata for a single watched table.
///
/// Built at discovery time from the database catalog plus any explicit
/// overrides supplied at registration. Read-only after startup.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    /// Schema the table lives in
    pub schema: String,
    /// Table name as it appears in the database
    pub table: String,
    /// Declared columns in ordinal order
    pub columns: Vec<String>,
    /// column name -> property name
    pub column_to_property: HashMap<String, String>,
    /// property name -> column name
    pub property_to_column: HashMap<String, String>,
}

impl TableDescriptor {
    /// Build a descriptor from the ordered column list, applying explicit
    /// `(column, property)` overrides before falling back to the default
    /// snake_case-to-camelCase derivation.
    pub fn new(
        schema: &str,
        table: &str,
        columns: Vec<String>,
        overrides: &[(String, String)],
    ) -> Self {
        let explicit: HashMap<&str, &str> = overrides
            .iter()
            .map(|(column, property)| (column.as_str(), property.as_str()))
            .collect();

        let mut forward = HashMap::with_capacity(columns.len());
        let mut reverse = HashMap::with_capacity(columns.len());
        for column in &columns {
            let property = match explicit.get(column.as_str()) {
                Some(property) => (*property).to_string(),
                None => column_to_property(column),
            };
            forward.insert(column.clone(), property.clone());
            reverse.insert(property, column.clone());
        }

        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            column_to_property: forward,
            property_to_column: reverse,
        }
    }

    /// Qualified `schema.table` name for logging.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Remap a raw row object from database column names to property names.
    ///
    /// Keys without a mapping (e.g. columns added after discovery) pass
    /// through unchanged rather than being dropped.
    pub fn remap_row(&self, row: &Map<String, Value>) -> Map<String, Value> {
        let mut remapped = Map::new();
        for (key, value) in row {
            let property = self
                .column_to_property
                .get(key)
                .cloned()
                .unwrap_or_else(|| key.clone());
            remapped.insert(property, value.clone());
        }
        remapped
    }

    /// Translate a list of property names into database column names,
    /// skipping properties the table does not declare.
    pub fn columns_for_properties(&self, properties: &[String]) -> Vec<String> {
        properties
            .iter()
            .filter_map(|property| self.property_to_column.get(property).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_hash_is_pure() {
        assert_eq!(stable_hash("pg_pubsub"), stable_hash("pg_pubsub"));
        assert_eq!(stable_hash(""), stable_hash(""));
    }

    #[test]
    fn test_stable_hash_range() {
        for input in ["", "a", "pg_pubsub", "public.users", "日本語", "\u{10348}"] {
            let h = stable_hash(input);
            assert!(
                (0..(1i64 << 31) - 1).contains(&h),
                "hash of {:?} out of range: {}",
                input,
                h
            );
        }
    }

    #[test]
    fn test_stable_hash_empty_is_zero() {
        assert_eq!(stable_hash(""), 0);
    }

    #[test]
    fn test_stable_hash_distinguishes_keys() {
        assert_ne!(stable_hash("pg_pubsub"), stable_hash("pg_pubsub2"));
    }

    #[test]
    fn test_column_to_property() {
        assert_eq!(column_to_property("created_at"), "createdAt");
        assert_eq!(column_to_property("name"), "name");
        assert_eq!(column_to_property("user_profile_id"), "userProfileId");
        assert_eq!(column_to_property("id"), "id");
    }

    #[test]
    fn test_descriptor_maps_are_bijective() {
        let descriptor = TableDescriptor::new(
            "public",
            "users",
            vec!["id".into(), "full_name".into(), "created_at".into()],
            &[],
        );
        for column in &descriptor.columns {
            let property = &descriptor.column_to_property[column];
            assert_eq!(&descriptor.property_to_column[property], column);
        }
    }

    #[test]
    fn test_descriptor_overrides() {
        let descriptor = TableDescriptor::new(
            "public",
            "users",
            vec!["id".into(), "email_addr".into()],
            &[("email_addr".to_string(), "email".to_string())],
        );
        assert_eq!(descriptor.column_to_property["email_addr"], "email");
        assert_eq!(descriptor.property_to_column["email"], "email_addr");
    }

    #[test]
    fn test_remap_row() {
        let descriptor = TableDescriptor::new(
            "public",
            "users",
            vec!["id".into(), "full_name".into()],
            &[],
        );
        let row = json!({"id": 7, "full_name": "Ada", "unmapped_col": true});
        let remapped = descriptor.remap_row(row.as_object().unwrap());
        assert_eq!(remapped["id"], json!(7));
        assert_eq!(remapped["fullName"], json!("Ada"));
        // Unknown keys pass through untouched.
        assert_eq!(remapped["unmapped_col"], json!(true));
    }

    #[test]
    fn test_columns_for_properties() {
        let descriptor = TableDescriptor::new(
            "public",
            "users",
            vec!["id".into(), "full_name".into()],
            &[],
        );
        let columns = descriptor
            .columns_for_properties(&["fullName".to_string(), "missing".to_string()]);
        assert_eq!(columns, vec!["full_name".to_string()]);
    }
}
