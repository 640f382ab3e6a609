use sqlx::PgPool;
use sqlx::postgres::types::PgInterval;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TagsetCache;

const PRUNE_BATCH: i64 = 1000;

// Series rows go first: the metric/tagset deletes below rely on the
// time_series referential check.
const DELETE_ORPHAN_SERIES: &str = "WITH doomed AS ( \
       SELECT metric_id, tagset_id FROM time_series \
       WHERE last_used < now() - $1 \
         AND NOT EXISTS ( \
           SELECT 1 FROM point p \
           WHERE p.metric_id = time_series.metric_id \
             AND p.tagset_id = time_series.tagset_id) \
       LIMIT $2) \
     DELETE FROM time_series ts USING doomed d \
     WHERE ts.metric_id = d.metric_id AND ts.tagset_id = d.tagset_id";

const DELETE_ORPHAN_METRICS: &str = "DELETE FROM metric \
     WHERE created < now() - $1 \
       AND NOT EXISTS (SELECT 1 FROM time_series ts WHERE ts.metric_id = metric.id)";

const DELETE_ORPHAN_TAGSETS: &str = "DELETE FROM tagset \
     WHERE created < now() - $1 \
       AND NOT EXISTS (SELECT 1 FROM time_series ts WHERE ts.tagset_id = tagset.id)";

/// One housekeeping pass: drain dead series in batches, then delete
/// retention-aged metrics and tagsets nothing references, then let the
/// tagset cache reconcile. Recently created rows are protected by the
/// retention guard so ingest cache entries cannot race a delete.
pub async fn run_cycle(
    pool: PgPool,
    cache: Arc<TagsetCache>,
    retention: Duration,
) -> anyhow::Result<()> {
    let retention = PgInterval {
        months: 0,
        days: 0,
        microseconds: retention.as_micros() as i64,
    };

    let mut series_pruned = 0u64;
    loop {
        let affected = sqlx::query(DELETE_ORPHAN_SERIES)
            .bind(retention.clone())
            .bind(PRUNE_BATCH)
            .execute(&pool)
            .await?
            .rows_affected();
        series_pruned += affected;
        if affected == 0 {
            break;
        }
    }

    let metrics_pruned = sqlx::query(DELETE_ORPHAN_METRICS)
        .bind(retention.clone())
        .execute(&pool)
        .await?
        .rows_affected();
    let tagsets_pruned = sqlx::query(DELETE_ORPHAN_TAGSETS)
        .bind(retention)
        .execute(&pool)
        .await?
        .rows_affected();

    if series_pruned + metrics_pruned + tagsets_pruned > 0 {
        tracing::info!(
            "housekeeping: pruned {series_pruned} series, {metrics_pruned} metrics, {tagsets_pruned} tagsets",
        );
    }

    cache.prune(&pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_prune_is_batched_and_guarded() {
        assert!(DELETE_ORPHAN_SERIES.contains("LIMIT $2"));
        assert!(DELETE_ORPHAN_SERIES.contains("last_used < now() - $1"));
        assert!(DELETE_ORPHAN_SERIES.contains("NOT EXISTS"));
    }

    #[test]
    fn orphan_deletes_respect_retention_and_references() {
        for sql in [DELETE_ORPHAN_METRICS, DELETE_ORPHAN_TAGSETS] {
            assert!(sql.contains("created < now() - $1"));
            assert!(sql.contains("NOT EXISTS (SELECT 1 FROM time_series"));
        }
    }
}
