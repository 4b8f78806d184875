//! SQLite storage driver.
//!
//! # Responsibility
//! - Map entity models onto tables (`set`) and columns.
//! - Apply session batches inside one SQLite transaction.
//!
//! # Invariants
//! - Identifiers come from static models and are always quoted.
//! - Updates and deletes that match no row fail the whole batch.

use super::{PendingWrite, StoreBackend, StoreError, StoreResult};
use crate::config::ConnectionInfo;
use crate::db::open_with;
use crate::model::{Cardinality, Discriminator, EntityId, EntityModel, Record, Value};
use rusqlite::{params, params_from_iter, Connection, Params};

/// SQLite-backed store owning one connection.
pub struct SqliteStore {
    conn: Connection,
    label: String,
}

impl SqliteStore {
    /// Opens the database described by `info`.
    pub fn open(info: &ConnectionInfo) -> StoreResult<Self> {
        let conn = open_with(info)?;
        Ok(Self::from_connection(conn, format!("sqlite:{}", info.path())))
    }

    pub fn from_connection(conn: Connection, label: impl Into<String>) -> Self {
        Self {
            conn,
            label: label.into(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Returns user table names in alphabetical order.
    pub fn list_sets(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name
             FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC;",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn query_rows<P: Params>(
        &self,
        model: &EntityModel,
        sql: &str,
        params: P,
    ) -> StoreResult<Vec<(EntityId, Record)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params)?;
        let mut loaded = Vec::new();

        while let Some(row) = rows.next()? {
            let mut id = None;
            let mut record = Record::new();
            for (index, column) in columns.iter().enumerate() {
                let value: Value = row.get(index)?;
                if column == model.key_column {
                    id = Some(parse_key(model, value)?);
                } else {
                    record.insert(column.clone(), value);
                }
            }

            let id = id.ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "`{}` rows have no key column `{}`",
                    model.set, model.key_column
                ))
            })?;
            loaded.push((id, record));
        }

        Ok(loaded)
    }
}

impl StoreBackend for SqliteStore {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn has_set(&self, model: &EntityModel) -> StoreResult<bool> {
        table_exists(&self.conn, model.set)
    }

    fn check_record(&self, model: &'static EntityModel, record: &Record) -> StoreResult<()> {
        let columns = table_columns(&self.conn, model.set)?;
        if columns.is_empty() {
            return Err(StoreError::MissingSet(model.set));
        }

        for navigation in model
            .navigations
            .iter()
            .filter(|nav| nav.cardinality == Cardinality::One)
        {
            if !columns.iter().any(|column| column == navigation.foreign_key) {
                return Err(StoreError::Multiplicity {
                    model: model.name,
                    navigation: navigation.name,
                    detail: format!(
                        "foreign key `{}` is not a column of `{}`",
                        navigation.foreign_key, model.set
                    ),
                });
            }
        }

        if let Some(column) = record
            .keys()
            .find(|column| !columns.iter().any(|known| known == *column))
        {
            return Err(StoreError::InvalidData(format!(
                "column `{column}` is not part of `{}`",
                model.set
            )));
        }

        Ok(())
    }

    fn fetch(&self, model: &EntityModel, id: EntityId) -> StoreResult<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1;",
            quote(model.set),
            quote(model.key_column)
        );
        let mut rows = self.query_rows(model, &sql, [id])?;
        Ok(rows.pop().map(|(_, record)| record))
    }

    fn fetch_where(
        &self,
        model: &EntityModel,
        column: &str,
        value: &Value,
    ) -> StoreResult<Vec<(EntityId, Record)>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 ORDER BY {} ASC;",
            quote(model.set),
            quote(column),
            quote(model.key_column)
        );
        self.query_rows(model, &sql, [value])
    }

    fn fetch_all(
        &self,
        model: &EntityModel,
        filter: Option<&Discriminator>,
    ) -> StoreResult<Vec<(EntityId, Record)>> {
        match filter {
            Some(discriminator) => {
                let sql = format!(
                    "SELECT * FROM {} WHERE {} = ?1 ORDER BY {} ASC;",
                    quote(model.set),
                    quote(discriminator.column),
                    quote(model.key_column)
                );
                self.query_rows(model, &sql, params![discriminator.value])
            }
            None => {
                let sql = format!(
                    "SELECT * FROM {} ORDER BY {} ASC;",
                    quote(model.set),
                    quote(model.key_column)
                );
                self.query_rows(model, &sql, [])
            }
        }
    }

    fn apply(&mut self, writes: &[PendingWrite<'_>]) -> StoreResult<Vec<EntityId>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(writes.len());

        for write in writes {
            let id = match *write {
                PendingWrite::Insert { model, id, values } => insert_row(&tx, model, id, values)?,
                PendingWrite::Update { model, id, values } => {
                    update_row(&tx, model, id, values)?;
                    id
                }
                PendingWrite::Delete { model, id } => {
                    let changed = tx.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1;",
                            quote(model.set),
                            quote(model.key_column)
                        ),
                        [id],
                    )?;
                    if changed == 0 {
                        return Err(StoreError::Conflict {
                            model: model.name,
                            id,
                        });
                    }
                    id
                }
            };
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }
}

fn insert_row(
    conn: &Connection,
    model: &EntityModel,
    id: Option<EntityId>,
    values: &Record,
) -> StoreResult<EntityId> {
    let mut columns: Vec<&str> = Vec::with_capacity(values.len() + 2);
    let mut bound: Vec<Value> = Vec::with_capacity(values.len() + 2);

    if let Some(id) = id {
        columns.push(model.key_column);
        bound.push(Value::Integer(id));
    }
    for (column, value) in values {
        columns.push(column.as_str());
        bound.push(value.clone());
    }
    if let Some(discriminator) = model.discriminator {
        if !values.contains_key(discriminator.column) {
            columns.push(discriminator.column);
            bound.push(Value::Text(discriminator.value.to_string()));
        }
    }

    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES;", quote(model.set))
    } else {
        let names = columns
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({names}) VALUES ({placeholders});",
            quote(model.set)
        )
    };

    conn.execute(&sql, params_from_iter(bound))?;
    Ok(id.unwrap_or_else(|| conn.last_insert_rowid()))
}

fn update_row(
    conn: &Connection,
    model: &EntityModel,
    id: EntityId,
    values: &Record,
) -> StoreResult<()> {
    if values.is_empty() {
        return Ok(());
    }

    let assignments = values
        .keys()
        .enumerate()
        .map(|(index, column)| format!("{} = ?{}", quote(column), index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE {} = ?{};",
        quote(model.set),
        quote(model.key_column),
        values.len() + 1
    );

    let mut bound: Vec<Value> = values.values().cloned().collect();
    bound.push(Value::Integer(id));

    let changed = conn.execute(&sql, params_from_iter(bound))?;
    if changed == 0 {
        return Err(StoreError::Conflict {
            model: model.name,
            id,
        });
    }
    Ok(())
}

fn parse_key(model: &EntityModel, value: Value) -> StoreResult<EntityId> {
    match value {
        Value::Integer(id) => Ok(id),
        other => Err(StoreError::InvalidData(format!(
            "non-integer key {other:?} in {}.{}",
            model.set, model.key_column
        ))),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", quote(table)))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}
