//! Postgres stores for tally-service.

use crate::models::{
    BucketKey, Dimension, Event, Granularity, Host, HostBucket, HostFacts, HostHardwareType,
    MetricId, MonthlyTotal, Snapshot, SnapshotKey, SnapshotMeasurement, SnapshotRecord, HBI_HOST,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{EventStore, FactSource, HostStore, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

fn db_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "tally-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| db_error("Migration failed", e))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Row mappings
// =========================================================================

#[derive(Debug, FromRow)]
struct HostRow {
    id: Uuid,
    org_id: String,
    instance_id: String,
    instance_type: String,
    inventory_id: Option<String>,
    insights_id: Option<String>,
    subscription_manager_id: Option<String>,
    hypervisor_uuid: Option<String>,
    display_name: Option<String>,
    hardware_type: Option<String>,
    cloud_provider: Option<String>,
    billing_provider: Option<String>,
    billing_account_id: Option<String>,
    is_guest: bool,
    is_hypervisor: bool,
    is_unmapped_guest: bool,
    num_of_guests: Option<i32>,
    last_seen: Option<DateTime<Utc>>,
    measurements: Json<BTreeMap<MetricId, f64>>,
    monthly_totals: Json<Vec<MonthlyTotal>>,
    buckets: Json<Vec<HostBucket>>,
    last_applied_event_record_date: Json<BTreeMap<String, DateTime<Utc>>>,
}

impl From<HostRow> for Host {
    fn from(row: HostRow) -> Self {
        Host {
            id: row.id,
            org_id: row.org_id,
            instance_id: row.instance_id,
            instance_type: row.instance_type,
            inventory_id: row.inventory_id,
            insights_id: row.insights_id,
            subscription_manager_id: row.subscription_manager_id,
            hypervisor_uuid: row.hypervisor_uuid,
            display_name: row.display_name,
            hardware_type: row.hardware_type.as_deref().and_then(HostHardwareType::from_str),
            cloud_provider: row.cloud_provider,
            billing_provider: row.billing_provider,
            billing_account_id: row.billing_account_id,
            is_guest: row.is_guest,
            is_hypervisor: row.is_hypervisor,
            is_unmapped_guest: row.is_unmapped_guest,
            num_of_guests: row.num_of_guests,
            last_seen: row.last_seen,
            measurements: row.measurements.0,
            monthly_totals: row
                .monthly_totals
                .0
                .into_iter()
                .map(|total| (total.key, total.value))
                .collect(),
            buckets: row
                .buckets
                .0
                .into_iter()
                .map(|bucket| (bucket.key.clone(), bucket))
                .collect::<BTreeMap<BucketKey, HostBucket>>(),
            last_applied_event_record_date: row.last_applied_event_record_date.0,
        }
    }
}

const HOST_COLUMNS: &str = "id, org_id, instance_id, instance_type, inventory_id, insights_id, \
     subscription_manager_id, hypervisor_uuid, display_name, hardware_type, cloud_provider, \
     billing_provider, billing_account_id, is_guest, is_hypervisor, is_unmapped_guest, \
     num_of_guests, last_seen, measurements, monthly_totals, buckets, \
     last_applied_event_record_date";

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: Uuid,
    org_id: String,
    product_id: String,
    granularity: String,
    sla: String,
    usage: String,
    billing_provider: String,
    billing_account_id: String,
    snapshot_date: DateTime<Utc>,
    measurements: Json<Vec<SnapshotMeasurement>>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = AppError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let granularity = Granularity::from_str(&row.granularity).ok_or_else(|| {
            db_error("Unknown granularity in tally_snapshots", &row.granularity)
        })?;
        Ok(SnapshotRecord {
            id: row.id,
            key: SnapshotKey {
                org_id: row.org_id,
                product_id: row.product_id,
                granularity,
                sla: Dimension::from_str(&row.sla),
                usage: Dimension::from_str(&row.usage),
                billing_provider: Dimension::from_str(&row.billing_provider),
                billing_account_id: Dimension::from_str(&row.billing_account_id),
                snapshot_date: row.snapshot_date,
            },
            measurements: row.measurements.0,
        }
        .into())
    }
}

// =========================================================================
// Inventory facts
// =========================================================================

#[async_trait]
impl FactSource for Database {
    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn active_system_count(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_system_count"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM inventory_host_facts
            WHERE org_id = $1
              AND (stale_timestamp IS NULL OR stale_timestamp > NOW() - make_interval(days => $2))
            "#,
        )
        .bind(org_id)
        .bind(culled_offset_days as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count active systems", e))?;

        timer.observe_duration();
        Ok(count)
    }

    fn stream_facts(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> BoxStream<'_, Result<HostFacts, AppError>> {
        sqlx::query_as::<_, HostFacts>(
            r#"
            SELECT org_id, inventory_id, provider_id, insights_id, display_name,
                   subscription_manager_id, owner_id, hypervisor_uuid, satellite_hypervisor_uuid,
                   infrastructure_type, cloud_provider, is_virtual, cores, sockets, arch,
                   rhsm_role, rhsm_sla, rhsm_usage, sync_timestamp,
                   satellite_role, satellite_sla, satellite_usage, product_ids
            FROM inventory_host_facts
            WHERE org_id = $1
              AND (stale_timestamp IS NULL OR stale_timestamp > NOW() - make_interval(days => $2))
            ORDER BY COALESCE(NULLIF(satellite_hypervisor_uuid, ''), NULLIF(hypervisor_uuid, ''), subscription_manager_id) COLLATE "C" NULLS LAST,
                     COALESCE(NULLIF(satellite_hypervisor_uuid, ''), NULLIF(hypervisor_uuid, '')) COLLATE "C" NULLS LAST,
                     inventory_id COLLATE "C" NULLS LAST
            "#,
        )
        .bind(org_id.to_string())
        .bind(culled_offset_days as i32)
        .fetch(&self.pool)
        .map(|row| row.map_err(|e| db_error("Failed to stream facts", e)))
        .boxed()
    }

    fn stream_active_hypervisor_ids(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> BoxStream<'_, Result<String, AppError>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT subscription_manager_id COLLATE "C" AS id
            FROM inventory_host_facts
            WHERE org_id = $1
              AND subscription_manager_id IS NOT NULL
              AND (stale_timestamp IS NULL OR stale_timestamp > NOW() - make_interval(days => $2))
            ORDER BY id
            "#,
        )
        .bind(org_id.to_string())
        .bind(culled_offset_days as i32)
        .fetch(&self.pool)
        .map(|row| row.map_err(|e| db_error("Failed to stream hypervisor ids", e)))
        .boxed()
    }

    #[instrument(skip(self))]
    async fn org_ids_with_facts(&self) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar("SELECT DISTINCT org_id FROM inventory_host_facts ORDER BY org_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list orgs", e))
    }
}

// =========================================================================
// Hosts
// =========================================================================

#[async_trait]
impl HostStore for Database {
    fn stream_hbi_hosts(&self, org_id: &str) -> BoxStream<'_, Result<Host, AppError>> {
        sqlx::query_as::<_, HostRow>(
            r#"
            SELECT id, org_id, instance_id, instance_type, inventory_id, insights_id,
                   subscription_manager_id, hypervisor_uuid, display_name, hardware_type,
                   cloud_provider, billing_provider, billing_account_id, is_guest, is_hypervisor,
                   is_unmapped_guest, num_of_guests, last_seen, measurements, monthly_totals,
                   buckets, last_applied_event_record_date
            FROM hosts
            WHERE org_id = $1 AND instance_type = $2
            ORDER BY COALESCE(NULLIF(hypervisor_uuid, ''), subscription_manager_id) COLLATE "C" NULLS LAST,
                     NULLIF(hypervisor_uuid, '') COLLATE "C" NULLS LAST,
                     inventory_id COLLATE "C" NULLS LAST
            "#,
        )
        .bind(org_id.to_string())
        .bind(HBI_HOST)
        .fetch(&self.pool)
        .map(|row| {
            row.map(Host::from)
                .map_err(|e| db_error("Failed to stream hosts", e))
        })
        .boxed()
    }

    #[instrument(skip(self, instance_ids), fields(org_id = %org_id, count = instance_ids.len()))]
    async fn find_by_instance_ids(
        &self,
        org_id: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Host>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_hosts_by_instance_ids"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM hosts WHERE org_id = $1 AND instance_id = ANY($2)",
            HOST_COLUMNS
        );
        let rows = sqlx::query_as::<_, HostRow>(&sql)
            .bind(org_id)
            .bind(instance_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to find hosts", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Host::from).collect())
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn find_by_org(&self, org_id: &str) -> Result<Vec<Host>, AppError> {
        let sql = format!(
            "SELECT {} FROM hosts WHERE org_id = $1 ORDER BY instance_id",
            HOST_COLUMNS
        );
        let rows = sqlx::query_as::<_, HostRow>(&sql)
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to find hosts", e))?;
        Ok(rows.into_iter().map(Host::from).collect())
    }

    #[instrument(skip(self, hosts), fields(count = hosts.len()))]
    async fn save_all(&self, hosts: &[Host]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_hosts"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for host in hosts {
            let monthly_totals: Vec<MonthlyTotal> = host
                .monthly_totals
                .iter()
                .map(|(key, value)| MonthlyTotal {
                    key: key.clone(),
                    value: *value,
                })
                .collect();
            let buckets: Vec<&HostBucket> = host.buckets.values().collect();

            sqlx::query(
                r#"
                INSERT INTO hosts (id, org_id, instance_id, instance_type, inventory_id, insights_id,
                    subscription_manager_id, hypervisor_uuid, display_name, hardware_type, cloud_provider,
                    billing_provider, billing_account_id, is_guest, is_hypervisor, is_unmapped_guest,
                    num_of_guests, last_seen, measurements, monthly_totals, buckets,
                    last_applied_event_record_date, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                        $19, $20, $21, $22, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    inventory_id = EXCLUDED.inventory_id,
                    insights_id = EXCLUDED.insights_id,
                    subscription_manager_id = EXCLUDED.subscription_manager_id,
                    hypervisor_uuid = EXCLUDED.hypervisor_uuid,
                    display_name = EXCLUDED.display_name,
                    hardware_type = EXCLUDED.hardware_type,
                    cloud_provider = EXCLUDED.cloud_provider,
                    billing_provider = EXCLUDED.billing_provider,
                    billing_account_id = EXCLUDED.billing_account_id,
                    is_guest = EXCLUDED.is_guest,
                    is_hypervisor = EXCLUDED.is_hypervisor,
                    is_unmapped_guest = EXCLUDED.is_unmapped_guest,
                    num_of_guests = EXCLUDED.num_of_guests,
                    last_seen = EXCLUDED.last_seen,
                    measurements = EXCLUDED.measurements,
                    monthly_totals = EXCLUDED.monthly_totals,
                    buckets = EXCLUDED.buckets,
                    last_applied_event_record_date = EXCLUDED.last_applied_event_record_date,
                    updated_utc = NOW()
                "#,
            )
            .bind(host.id)
            .bind(&host.org_id)
            .bind(&host.instance_id)
            .bind(&host.instance_type)
            .bind(&host.inventory_id)
            .bind(&host.insights_id)
            .bind(&host.subscription_manager_id)
            .bind(&host.hypervisor_uuid)
            .bind(&host.display_name)
            .bind(host.hardware_type.map(|t| t.as_str()))
            .bind(&host.cloud_provider)
            .bind(&host.billing_provider)
            .bind(&host.billing_account_id)
            .bind(host.is_guest)
            .bind(host.is_hypervisor)
            .bind(host.is_unmapped_guest)
            .bind(host.num_of_guests)
            .bind(host.last_seen)
            .bind(Json(&host.measurements))
            .bind(Json(&monthly_totals))
            .bind(Json(&buckets))
            .bind(Json(&host.last_applied_event_record_date))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to save host", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit hosts", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, host_ids), fields(count = host_ids.len()))]
    async fn delete_all(&self, host_ids: &[Uuid]) -> Result<(), AppError> {
        if host_ids.is_empty() {
            return Ok(());
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_hosts"])
            .start_timer();

        sqlx::query("DELETE FROM hosts WHERE id = ANY($1)")
            .bind(host_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete hosts", e))?;

        timer.observe_duration();
        Ok(())
    }
}

// =========================================================================
// Snapshots
// =========================================================================

#[async_trait]
impl SnapshotStore for Database {
    #[instrument(skip(self, product_ids), fields(org_id = %org_id, granularity = %granularity))]
    async fn find_snapshots(
        &self,
        org_id: &str,
        product_ids: &BTreeSet<String>,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_snapshots"])
            .start_timer();

        let products: Vec<&str> = product_ids.iter().map(String::as_str).collect();
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT id, org_id, product_id, granularity, sla, usage, billing_provider,
                   billing_account_id, snapshot_date, measurements
            FROM tally_snapshots
            WHERE org_id = $1 AND product_id = ANY($2) AND granularity = $3
              AND snapshot_date >= $4 AND snapshot_date <= $5
            ORDER BY snapshot_date, product_id
            "#,
        )
        .bind(org_id)
        .bind(&products)
        .bind(granularity.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find snapshots", e))?;

        timer.observe_duration();
        rows.into_iter().map(Snapshot::try_from).collect()
    }

    #[instrument(skip(self, snapshots), fields(count = snapshots.len()))]
    async fn save_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_snapshots"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for snapshot in snapshots {
            let record = SnapshotRecord::from(snapshot);
            let key = &record.key;
            sqlx::query(
                r#"
                INSERT INTO tally_snapshots (id, org_id, product_id, granularity, sla, usage,
                    billing_provider, billing_account_id, snapshot_date, measurements)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (org_id, product_id, granularity, sla, usage, billing_provider,
                             billing_account_id, snapshot_date)
                DO UPDATE SET measurements = EXCLUDED.measurements, updated_utc = NOW()
                "#,
            )
            .bind(record.id)
            .bind(&key.org_id)
            .bind(&key.product_id)
            .bind(key.granularity.as_str())
            .bind(key.sla.as_str())
            .bind(key.usage.as_str())
            .bind(key.billing_provider.as_str())
            .bind(key.billing_account_id.as_str())
            .bind(key.snapshot_date)
            .bind(Json(&record.measurements))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to save snapshot", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit snapshots", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(granularity = %granularity, cutoff = %cutoff))]
    async fn delete_snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_snapshots_before"])
            .start_timer();

        let result =
            sqlx::query("DELETE FROM tally_snapshots WHERE granularity = $1 AND snapshot_date < $2")
                .bind(granularity.as_str())
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("Failed to purge snapshots", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =========================================================================
// Events and tally state
// =========================================================================

#[async_trait]
impl EventStore for Database {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn save_events(&self, events: &[Event]) -> Result<usize, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_events"])
            .start_timer();

        let mut inserted = 0;
        for event in events {
            let result = sqlx::query(
                r#"
                INSERT INTO events (event_id, org_id, instance_id, service_type, event_timestamp,
                    record_date, data)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(event.event_id)
            .bind(&event.org_id)
            .bind(&event.instance_id)
            .bind(&event.service_type)
            .bind(event.timestamp)
            .bind(event.record_date)
            .bind(Json(event))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to save event", e))?;
            inserted += result.rows_affected() as usize;
        }

        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn find_events_recorded_after(
        &self,
        org_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_events"])
            .start_timer();

        let rows: Vec<Json<Event>> = sqlx::query_scalar(
            r#"
            SELECT data FROM events
            WHERE org_id = $1 AND ($2::timestamptz IS NULL OR record_date > $2)
            ORDER BY event_timestamp, record_date
            "#,
        )
        .bind(org_id)
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find events", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    #[instrument(skip(self))]
    async fn org_ids_with_events(&self) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar("SELECT DISTINCT org_id FROM events ORDER BY org_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list orgs", e))
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn last_event_applied(&self, org_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        sqlx::query_scalar("SELECT latest_event_record_date FROM tally_state WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read tally state", e))
    }

    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn set_last_event_applied(
        &self,
        org_id: &str,
        record_date: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO tally_state (org_id, latest_event_record_date)
            VALUES ($1, $2)
            ON CONFLICT (org_id) DO UPDATE SET
                latest_event_record_date = GREATEST(tally_state.latest_event_record_date, EXCLUDED.latest_event_record_date)
            "#,
        )
        .bind(org_id)
        .bind(record_date)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update tally state", e))?;
        Ok(())
    }
}
