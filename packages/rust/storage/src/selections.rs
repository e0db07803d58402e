//! Selection store: versioned, immutable materialization records.
//!
//! Versions are dense per `(builder_id, content_type)`. Allocation and insert
//! happen in one immediate transaction, and the table's UNIQUE constraint
//! turns any race that slips past it into a retryable conflict.

use libsql::{Connection, params};
use tracing::debug;
use wikiselect_shared::{
    NewSelection, Result, Selection, SelectionStatus, WikiSelectError,
};

use crate::{Storage, db_err, get_i64, get_opt_string, get_string, now_ts, parse_ts, ts};

const SELECTION_COLUMNS: &str = "id, builder_id, content_type, version, storage_key, status,
     error_messages_json, article_count, content_hash, updated_at";

impl Storage {
    /// Next free version for `(builder_id, content_type)`: `max + 1`, or 1.
    pub async fn next_version(&self, builder_id: &str, content_type: &str) -> Result<i64> {
        next_version_on(&self.conn, builder_id, content_type).await
    }

    /// Insert a selection row as-is. Fails with a conflict if the version is taken.
    pub async fn record(&self, selection: &Selection) -> Result<()> {
        insert_selection_on(&self.conn, selection).await
    }

    /// Allocate the next version and insert the selection atomically.
    pub async fn record_next_version(&self, new_selection: NewSelection) -> Result<Selection> {
        self.immediate(|conn| async move {
            let version =
                next_version_on(&conn, &new_selection.builder_id, &new_selection.content_type)
                    .await?;
            let selection = new_selection.with_version(version);
            insert_selection_on(&conn, &selection).await?;
            debug!(
                selection_id = %selection.id,
                builder_id = %selection.builder_id,
                version,
                "recorded selection"
            );
            Ok(selection)
        })
        .await
    }

    /// Flip a selection to `ERROR`. Refused once an archive export has finished for it.
    pub async fn mark_failed(&self, selection_id: &str, errors: &[String]) -> Result<()> {
        let errors_json = serde_json::to_string(errors)
            .map_err(|e| WikiSelectError::Storage(format!("encode errors: {e}")))?;
        let updated = self
            .conn
            .execute(
                "UPDATE selections SET status = 'ERROR', error_messages_json = ?1, updated_at = ?2
                 WHERE id = ?3
                   AND NOT EXISTS (
                     SELECT 1 FROM archive_tasks
                     WHERE selection_id = ?3 AND status IN ('COMPLETED', 'FAILED'))",
                params![errors_json, now_ts(), selection_id],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return match self.get_selection(selection_id).await? {
                None => Err(WikiSelectError::not_found(format!("selection {selection_id}"))),
                Some(_) => Err(WikiSelectError::conflict(format!(
                    "selection {selection_id} already has a finished archive export"
                ))),
            };
        }
        Ok(())
    }

    pub async fn get_selection(&self, id: &str) -> Result<Option<Selection>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECTION_COLUMNS} FROM selections WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_selection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// All selections of a builder, newest version first.
    pub async fn list_selections(&self, builder_id: &str) -> Result<Vec<Selection>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECTION_COLUMNS} FROM selections WHERE builder_id = ?1
                     ORDER BY content_type, version DESC"
                ),
                params![builder_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_selection(&row)?);
        }
        Ok(results)
    }

    /// Newest selection for `(builder_id, content_type)`.
    pub async fn latest_selection(
        &self,
        builder_id: &str,
        content_type: &str,
    ) -> Result<Option<Selection>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECTION_COLUMNS} FROM selections
                     WHERE builder_id = ?1 AND content_type = ?2
                     ORDER BY version DESC LIMIT 1"
                ),
                params![builder_id, content_type],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_selection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Delete all but the newest `keep` versions of each content type.
    ///
    /// Selections with an in-flight archive request are kept. Returns the
    /// removed rows so their artifacts can be deleted.
    pub async fn prune_selections(&self, builder_id: &str, keep: u32) -> Result<Vec<Selection>> {
        let keep = i64::from(keep.max(1));
        self.immediate(|conn| async move {
            let mut rows = conn
                .query(
                    &format!(
                        "SELECT {SELECTION_COLUMNS} FROM selections s
                         WHERE s.builder_id = ?1
                           AND (SELECT COUNT(*) FROM selections newer
                                WHERE newer.builder_id = s.builder_id
                                  AND newer.content_type = s.content_type
                                  AND newer.version > s.version) >= ?2
                           AND NOT EXISTS (
                             SELECT 1 FROM archive_tasks a
                             WHERE a.selection_id = s.id AND a.status = 'REQUESTED')"
                    ),
                    params![builder_id, keep],
                )
                .await
                .map_err(db_err)?;

            let mut pruned = Vec::new();
            while let Ok(Some(row)) = rows.next().await {
                pruned.push(row_to_selection(&row)?);
            }

            for selection in &pruned {
                conn.execute("DELETE FROM selections WHERE id = ?1", params![selection.id.as_str()])
                    .await
                    .map_err(db_err)?;
            }
            Ok(pruned)
        })
        .await
    }
}

async fn next_version_on(conn: &Connection, builder_id: &str, content_type: &str) -> Result<i64> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM selections
             WHERE builder_id = ?1 AND content_type = ?2",
            params![builder_id, content_type],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await {
        Ok(Some(row)) => get_i64(&row, 0),
        Ok(None) => Ok(1),
        Err(e) => Err(db_err(e)),
    }
}

async fn insert_selection_on(conn: &Connection, selection: &Selection) -> Result<()> {
    let errors_json = if selection.error_messages.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&selection.error_messages)
                .map_err(|e| WikiSelectError::Storage(format!("encode errors: {e}")))?,
        )
    };

    conn.execute(
        "INSERT INTO selections (id, builder_id, content_type, version, storage_key, status,
           error_messages_json, article_count, content_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            selection.id.as_str(),
            selection.builder_id.as_str(),
            selection.content_type.as_str(),
            selection.version,
            selection.storage_key.as_str(),
            selection.status.to_string(),
            errors_json,
            selection.article_count as i64,
            selection.content_hash.as_deref(),
            ts(&selection.updated_at),
        ],
    )
    .await
    .map_err(|e| match db_err(e) {
        WikiSelectError::Conflict { .. } => WikiSelectError::conflict(format!(
            "version {} of {} for builder {} already exists",
            selection.version, selection.content_type, selection.builder_id
        )),
        other => other,
    })?;
    Ok(())
}

fn row_to_selection(row: &libsql::Row) -> Result<Selection> {
    let status: SelectionStatus = get_string(row, 5)?
        .parse()
        .map_err(WikiSelectError::Storage)?;
    let error_messages = match get_opt_string(row, 6) {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| WikiSelectError::Storage(format!("invalid error_messages_json: {e}")))?,
        None => Vec::new(),
    };

    Ok(Selection {
        id: get_string(row, 0)?,
        builder_id: get_string(row, 1)?,
        content_type: get_string(row, 2)?,
        version: get_i64(row, 3)?,
        storage_key: get_string(row, 4)?,
        status,
        error_messages,
        article_count: get_i64(row, 7)?.max(0) as u64,
        content_hash: get_opt_string(row, 8),
        updated_at: parse_ts(&get_string(row, 9)?)?,
    })
}
