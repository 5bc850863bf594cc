//! Redb table definitions for the metadata index.

use redb::TableDefinition;

// Key: "m\0{run}" or "d\0{run}\0{path}", Value: JSON-encoded IndexedObject
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");
