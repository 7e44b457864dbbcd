//! Postgres implementation of the store ports. All SQL is runtime-checked
//! (`sqlx::query`, not `sqlx::query!`) so builds never need a live database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghgi_core::{
    ActivityGas, ActivityRecord, EmissionFactor, EmissionRecord, Gas, GasAmount,
    GpcReferenceNumber, InventoryTarget, PopulationSample, ReportingLevel,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{EmissionsStore, InventoryStore, PopulationStore, StoreError, WriteOutcome};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    async fn delete_record_tree(
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM gas_amount WHERE emission_record_id = $1")
            .bind(record_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM activity_record WHERE emission_record_id = $1")
            .bind(record_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM emission_record WHERE id = $1")
            .bind(record_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_record_tree(
        tx: &mut Transaction<'_, Postgres>,
        record: &EmissionRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO emission_record (
                id, inventory_id, gpc_reference_number, co2eq_kg, co2eq_years,
                co2eq_20yr_kg, data_quality, datasource_id, unavailable_reason,
                unavailable_explanation, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.inventory_id)
        .bind(record.gpc_reference_number.to_string())
        .bind(record.co2eq_kg)
        .bind(co2eq_years_column(record.co2eq_years)?)
        .bind(record.co2eq_20yr_kg)
        .bind(record.data_quality.as_deref())
        .bind(record.datasource_id.as_deref())
        .bind(record.unavailable_reason.as_deref())
        .bind(record.unavailable_explanation.as_deref())
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;

        for gas in &record.gases {
            sqlx::query(
                r#"
                INSERT INTO gas_amount (emission_record_id, gas, amount_kg)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(record.id)
            .bind(gas.gas.as_str())
            .bind(gas.amount_kg)
            .execute(&mut **tx)
            .await?;
        }

        for (position, activity) in record.activities.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Corrupt(format!("too many activities on {}", record.id)))?;
            sqlx::query(
                r#"
                INSERT INTO activity_record (
                    id, emission_record_id, position, activity_amount, unit, co2eq_kg, metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(activity.id)
            .bind(record.id)
            .bind(position)
            .bind(activity.activity_amount)
            .bind(&activity.unit)
            .bind(activity.co2eq_kg)
            .bind(Json(&activity.metadata))
            .execute(&mut **tx)
            .await?;

            for gas in &activity.gases {
                let (factor_value, factor_units) = match &gas.emission_factor {
                    Some(f) => (Some(f.value), Some(f.units.as_str())),
                    None => (None, None),
                };
                sqlx::query(
                    r#"
                    INSERT INTO gas_amount (
                        emission_record_id, activity_record_id, gas, amount_kg,
                        emission_factor_value, emission_factor_units
                    ) VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(record.id)
                .bind(activity.id)
                .bind(gas.gas.as_str())
                .bind(gas.amount_kg)
                .bind(factor_value)
                .bind(factor_units)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

/// Global warming potential horizon as stored in `SMALLINT`.
fn co2eq_years_column(years: u16) -> Result<i16, StoreError> {
    i16::try_from(years)
        .map_err(|_| StoreError::Corrupt(format!("co2eq_years {years} exceeds SMALLINT")))
}

fn parse_reporting_level(raw: &str) -> Result<ReportingLevel, StoreError> {
    match raw {
        "basic" => Ok(ReportingLevel::Basic),
        "basic_plus" => Ok(ReportingLevel::BasicPlus),
        other => Err(StoreError::Corrupt(format!("unknown reporting level `{other}`"))),
    }
}

fn parse_gas(raw: &str) -> Result<Gas, StoreError> {
    Gas::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown gas `{raw}`")))
}

fn parse_gpc(raw: &str) -> Result<GpcReferenceNumber, StoreError> {
    raw.parse()
        .map_err(|err| StoreError::Corrupt(format!("{err}")))
}

fn record_from_row(row: &PgRow) -> Result<EmissionRecord, StoreError> {
    let gpc: String = row.try_get("gpc_reference_number")?;
    let years: i16 = row.try_get("co2eq_years")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(EmissionRecord {
        id: row.try_get("id")?,
        inventory_id: row.try_get("inventory_id")?,
        gpc_reference_number: parse_gpc(&gpc)?,
        co2eq_kg: row.try_get("co2eq_kg")?,
        co2eq_years: u16::try_from(years)
            .map_err(|_| StoreError::Corrupt(format!("negative co2eq_years {years}")))?,
        co2eq_20yr_kg: row.try_get("co2eq_20yr_kg")?,
        data_quality: row.try_get("data_quality")?,
        datasource_id: row.try_get("datasource_id")?,
        unavailable_reason: row.try_get("unavailable_reason")?,
        unavailable_explanation: row.try_get("unavailable_explanation")?,
        gases: Vec::new(),
        activities: Vec::new(),
        created_at,
    })
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn inventory_target(
        &self,
        inventory_id: Uuid,
    ) -> Result<Option<InventoryTarget>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT i.inventory_id, i.city_id, i.year, i.reporting_level,
                   c.locode, c.region_locode, c.country_locode
              FROM inventory i
              JOIN city c ON c.city_id = i.city_id
             WHERE i.inventory_id = $1
            "#,
        )
        .bind(inventory_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let level: String = row.try_get("reporting_level")?;
        Ok(Some(InventoryTarget {
            inventory_id: row.try_get("inventory_id")?,
            city_id: row.try_get("city_id")?,
            year: row.try_get("year")?,
            city_code: row.try_get("locode")?,
            region_code: row.try_get("region_locode")?,
            country_code: row.try_get("country_locode")?,
            reporting_level: parse_reporting_level(&level)?,
        }))
    }
}

#[async_trait]
impl PopulationStore for PgStore {
    async fn population_samples(
        &self,
        city_id: Uuid,
        from_year: i32,
        to_year: i32,
    ) -> Result<Vec<PopulationSample>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT city_id, year, population, region_population, country_population
              FROM population
             WHERE city_id = $1
               AND year BETWEEN $2 AND $3
             ORDER BY year DESC
            "#,
        )
        .bind(city_id)
        .bind(from_year)
        .bind(to_year)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PopulationSample {
                    city_id: row.try_get("city_id")?,
                    year: row.try_get("year")?,
                    population: row.try_get("population")?,
                    region_population: row.try_get("region_population")?,
                    country_population: row.try_get("country_population")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EmissionsStore for PgStore {
    async fn find_emission_record(
        &self,
        inventory_id: Uuid,
        gpc_reference_number: GpcReferenceNumber,
    ) -> Result<Option<EmissionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM emission_record WHERE inventory_id = $1 AND gpc_reference_number = $2")
            .bind(inventory_id)
            .bind(gpc_reference_number.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut records = vec![record_from_row(&row)?];
                self.attach_children(&mut records).await?;
                Ok(records.pop())
            }
            None => Ok(None),
        }
    }

    async fn write_emission_record(
        &self,
        record: &EmissionRecord,
        force_replace: bool,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM emission_record
             WHERE inventory_id = $1 AND gpc_reference_number = $2
             FOR UPDATE
            "#,
        )
        .bind(record.inventory_id)
        .bind(record.gpc_reference_number.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(_) if !force_replace => {
                tx.rollback().await?;
                return Err(StoreError::DuplicateRecord {
                    inventory_id: record.inventory_id,
                    gpc_reference_number: record.gpc_reference_number,
                });
            }
            Some(previous_id) => {
                debug!(%previous_id, gpc = %record.gpc_reference_number, "deleting record for force-replace");
                Self::delete_record_tree(&mut tx, previous_id).await?;
                WriteOutcome::Replaced { previous_id }
            }
            None => WriteOutcome::Inserted,
        };

        // The unique constraint catches a concurrent insert that slipped past the check.
        match Self::insert_record_tree(&mut tx, record).await {
            Err(StoreError::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                return Err(StoreError::DuplicateRecord {
                    inventory_id: record.inventory_id,
                    gpc_reference_number: record.gpc_reference_number,
                });
            }
            other => other?,
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn emission_records(
        &self,
        inventory_ids: &[Uuid],
    ) -> Result<Vec<EmissionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM emission_record
             WHERE inventory_id = ANY($1)
            "#,
        )
        .bind(inventory_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| {
            (a.inventory_id, a.gpc_reference_number).cmp(&(b.inventory_id, b.gpc_reference_number))
        });
        self.attach_children(&mut records).await?;
        Ok(records)
    }
}

impl PgStore {
    async fn attach_children(&self, records: &mut [EmissionRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

        let activity_rows = sqlx::query(
            r#"
            SELECT id, emission_record_id, activity_amount, unit, co2eq_kg, metadata
              FROM activity_record
             WHERE emission_record_id = ANY($1)
             ORDER BY emission_record_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut activities: HashMap<Uuid, Vec<ActivityRecord>> = HashMap::new();
        for row in &activity_rows {
            let parent: Uuid = row.try_get("emission_record_id")?;
            let metadata: Json<BTreeMap<String, String>> = row.try_get("metadata")?;
            let activity_amount: Decimal = row.try_get("activity_amount")?;
            activities.entry(parent).or_default().push(ActivityRecord {
                id: row.try_get("id")?,
                activity_amount,
                unit: row.try_get("unit")?,
                co2eq_kg: row.try_get("co2eq_kg")?,
                metadata: metadata.0,
                gases: Vec::new(),
            });
        }

        let gas_rows = sqlx::query(
            r#"
            SELECT emission_record_id, activity_record_id, gas, amount_kg,
                   emission_factor_value, emission_factor_units
              FROM gas_amount
             WHERE emission_record_id = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut gases: HashMap<Uuid, Vec<GasAmount>> = HashMap::new();
        for row in &gas_rows {
            let parent: Uuid = row.try_get("emission_record_id")?;
            let activity_id: Option<Uuid> = row.try_get("activity_record_id")?;
            let gas = parse_gas(row.try_get::<String, _>("gas")?.as_str())?;
            let amount_kg: i64 = row.try_get("amount_kg")?;

            match activity_id {
                None => gases
                    .entry(parent)
                    .or_default()
                    .push(GasAmount { gas, amount_kg }),
                Some(activity_id) => {
                    let value: Option<Decimal> = row.try_get("emission_factor_value")?;
                    let units: Option<String> = row.try_get("emission_factor_units")?;
                    let emission_factor = value.map(|value| EmissionFactor {
                        value,
                        units: units.unwrap_or_default(),
                    });
                    let activity = activities
                        .get_mut(&parent)
                        .and_then(|list| list.iter_mut().find(|a| a.id == activity_id))
                        .ok_or_else(|| {
                            StoreError::Corrupt(format!(
                                "gas row references missing activity {activity_id}"
                            ))
                        })?;
                    activity.gases.push(ActivityGas {
                        gas,
                        amount_kg,
                        emission_factor,
                    });
                }
            }
        }

        for record in records.iter_mut() {
            record.gases = gases.remove(&record.id).unwrap_or_default();
            record.gases.sort_by_key(|g| g.gas);
            record.activities = activities.remove(&record.id).unwrap_or_default();
        }
        Ok(())
    }
}
