//! Builder persistence.

use libsql::params;
use wikiselect_shared::{Builder, Result, WikiSelectError};

use crate::{Storage, db_err, get_i64, get_string, now_ts, parse_ts, ts};

const BUILDER_COLUMNS: &str = "id, owner_id, name, project, model, params_json, current_version,
     selection_archive_version, created_at, updated_at";

impl Storage {
    /// Insert a new builder record.
    pub async fn insert_builder(&self, builder: &Builder) -> Result<()> {
        let params_json = serde_json::to_string(&builder.params)
            .map_err(|e| WikiSelectError::Storage(format!("encode params: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO builders (id, owner_id, name, project, model, params_json,
                   current_version, selection_archive_version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    builder.id.as_str(),
                    builder.owner_id.as_str(),
                    builder.name.as_str(),
                    builder.project.as_str(),
                    builder.model.as_str(),
                    params_json,
                    builder.current_version,
                    builder.selection_archive_version,
                    ts(&builder.created_at),
                    ts(&builder.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a builder by ID.
    pub async fn get_builder(&self, id: &str) -> Result<Option<Builder>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {BUILDER_COLUMNS} FROM builders WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_builder(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List builders, optionally restricted to one owner, most recently updated first.
    pub async fn list_builders(&self, owner_id: Option<&str>) -> Result<Vec<Builder>> {
        let mut rows = match owner_id {
            Some(owner) => self
                .conn
                .query(
                    &format!(
                        "SELECT {BUILDER_COLUMNS} FROM builders WHERE owner_id = ?1
                         ORDER BY updated_at DESC"
                    ),
                    params![owner],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!("SELECT {BUILDER_COLUMNS} FROM builders ORDER BY updated_at DESC"),
                    params![],
                )
                .await,
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_builder(&row)?);
        }
        Ok(results)
    }

    /// Replace a builder's user-editable definition.
    pub async fn update_builder_definition(
        &self,
        id: &str,
        name: &str,
        project: &str,
        model: &str,
        params: &serde_json::Value,
    ) -> Result<()> {
        let params_json = serde_json::to_string(params)
            .map_err(|e| WikiSelectError::Storage(format!("encode params: {e}")))?;
        let updated = self
            .conn
            .execute(
                "UPDATE builders SET name = ?1, project = ?2, model = ?3, params_json = ?4,
                   updated_at = ?5
                 WHERE id = ?6",
                params![name, project, model, params_json, now_ts(), id],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(WikiSelectError::not_found(format!("builder {id}")));
        }
        Ok(())
    }

    /// Advance the builder's current version. Never moves it backwards.
    pub async fn advance_current_version(&self, id: &str, version: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builders SET current_version = MAX(current_version, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![version, now_ts(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record the version an archive export was requested for.
    pub async fn set_selection_archive_version(&self, id: &str, version: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builders SET selection_archive_version = ?1, updated_at = ?2
                 WHERE id = ?3 AND ?1 <= current_version",
                params![version, now_ts(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a builder. Selections, their archive tasks and schedules cascade.
    pub async fn delete_builder(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM builders WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}

fn row_to_builder(row: &libsql::Row) -> Result<Builder> {
    let params_json = get_string(row, 5)?;
    Ok(Builder {
        id: get_string(row, 0)?,
        owner_id: get_string(row, 1)?,
        name: get_string(row, 2)?,
        project: get_string(row, 3)?,
        model: get_string(row, 4)?,
        params: serde_json::from_str(&params_json)
            .map_err(|e| WikiSelectError::Storage(format!("invalid params_json: {e}")))?,
        current_version: get_i64(row, 6)?,
        selection_archive_version: row.get::<i64>(7).ok(),
        created_at: parse_ts(&get_string(row, 8)?)?,
        updated_at: parse_ts(&get_string(row, 9)?)?,
    })
}
