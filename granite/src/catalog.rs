//! The tables known to an engine.
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::heap_file::HeapFile;
use crate::tuple::{FieldType, TupleDesc};
use crate::TableId;

#[derive(Debug)]
struct TableEntry {
    name: String,
    primary_key: Option<String>,
    file: Arc<HeapFile>,
}

/// Maps table ids to their heap files, names and primary keys.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<TableId, TableEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table. A table with the same name or the same file
    /// replaces the previous one.
    pub fn add_table(&self, file: HeapFile, name: &str, primary_key: Option<&str>) -> TableId {
        let id = file.id();
        let mut tables = self.tables.write();
        tables.retain(|other_id, entry| *other_id != id && entry.name != name);
        tables.insert(
            id,
            TableEntry {
                name: name.to_string(),
                primary_key: primary_key.map(str::to_string),
                file: Arc::new(file),
            },
        );
        id
    }

    pub fn table_id(&self, name: &str) -> DbResult<TableId> {
        self.tables
            .read()
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| DbError::NoSuchTable {
                table: name.to_string(),
            })
    }

    pub fn heap_file(&self, id: TableId) -> DbResult<Arc<HeapFile>> {
        self.with_table(id, |entry| entry.file.clone())
    }

    pub fn tuple_desc(&self, id: TableId) -> DbResult<Arc<TupleDesc>> {
        self.with_table(id, |entry| entry.file.desc().clone())
    }

    pub fn table_name(&self, id: TableId) -> DbResult<String> {
        self.with_table(id, |entry| entry.name.clone())
    }

    pub fn primary_key(&self, id: TableId) -> DbResult<Option<String>> {
        self.with_table(id, |entry| entry.primary_key.clone())
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<_> = self.tables.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    fn with_table<T>(&self, id: TableId, f: impl FnOnce(&TableEntry) -> T) -> DbResult<T> {
        self.tables
            .read()
            .get(&id)
            .map(f)
            .ok_or_else(|| DbError::NoSuchTable {
                table: format!("#{id}"),
            })
    }

    /// Loads tables from a schema file with one table per line:
    ///
    /// ```text
    /// users (id int pk, name string)
    /// ```
    ///
    /// Each table is stored in `<name>.dat` next to the schema file. Returns
    /// the ids of the loaded tables in file order.
    pub fn load_schema<P: AsRef<Path>>(&self, path: P) -> DbResult<Vec<TableId>> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let text = fs::read_to_string(path)?;

        let mut ids = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let schema = parse_table(line).map_err(|detail| DbError::SchemaParse {
                line: idx + 1,
                detail,
            })?;
            let types: Vec<_> = schema.fields.iter().map(|(_, t)| *t).collect();
            let names: Vec<_> = schema.fields.iter().map(|(n, _)| n.as_str()).collect();
            let desc = Arc::new(TupleDesc::new(&types, &names));
            let file = HeapFile::open(dir.join(format!("{}.dat", schema.name)), desc)?;
            ids.push(self.add_table(file, &schema.name, schema.primary_key.as_deref()));
            info!(table = %schema.name, fields = types.len(), "loaded table");
        }
        Ok(ids)
    }
}

struct TableSchema {
    name: String,
    fields: Vec<(String, FieldType)>,
    primary_key: Option<String>,
}

fn parse_table(line: &str) -> Result<TableSchema, String> {
    let open = line.find('(').ok_or("expected '('")?;
    let close = line.rfind(')').ok_or("expected ')'")?;
    if close < open {
        return Err("')' before '('".to_string());
    }
    if !line[close + 1..].trim().is_empty() {
        return Err("trailing characters after ')'".to_string());
    }
    let name = line[..open].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid table name {name:?}"));
    }

    let mut fields = Vec::new();
    let mut primary_key = None;
    for column in line[open + 1..close].split(',') {
        let parts: Vec<_> = column.split_whitespace().collect();
        let (field, ty, pk) = match parts.as_slice() {
            [field, ty] => (*field, *ty, false),
            [field, ty, marker] if marker.eq_ignore_ascii_case("pk") => (*field, *ty, true),
            _ => return Err(format!("invalid column {:?}", column.trim())),
        };
        let field_type =
            FieldType::parse(ty).ok_or_else(|| format!("unknown type {ty:?} for {field}"))?;
        if pk {
            if primary_key.is_some() {
                return Err("more than one primary key".to_string());
            }
            primary_key = Some(field.to_string());
        }
        fields.push((field.to_string(), field_type));
    }
    Ok(TableSchema {
        name: name.to_string(),
        fields,
        primary_key,
    })
}
