//! # store
//!
//! `sqlx`-backed `hes_core::store_api::Store` implementation, matching the
//! original `MySqlDatabase` collaborator (`original_source/HES/src/database.cpp`):
//! one connection pool per process, typed rows mapped straight off the
//! `SELECT`/`INSERT ... ON DUPLICATE KEY UPDATE` shapes the C++ source used
//! against the same table names (spec §6).

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, Row};
use tracing::{error, warn};

use hes_core::codec::DlmsValue;
use hes_core::error::EngineError;
use hes_core::store_api::{
    FuotaResumeRecord, MissingCycleInfo, PathRow, ProfileRecordBatch, RawPath, RequestStatus, Store,
};

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1) // one handle per gateway session, per §5
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    fn sql_err(context: &'static str, err: sqlx::Error) -> EngineError {
        error!(context, %err, "mysql query failed");
        // The store boundary only carries typed EngineError kinds the
        // transactor/scheduler already know how to react to; a bare
        // transport failure here surfaces the same as a gateway disconnect.
        EngineError::Transport(hes_core::error::TransportError::Disconnect)
    }

    fn mac_hex(mac: [u8; 8]) -> String {
        hex::encode_upper(mac)
    }
}

fn scalar_value_sql(value: &DlmsValue) -> String {
    match value {
        DlmsValue::None => "NULL".to_string(),
        DlmsValue::Bool(b) => (*b as u8).to_string(),
        DlmsValue::Int32(v) => v.to_string(),
        DlmsValue::Uint32(v) => v.to_string(),
        DlmsValue::Int8(v) => v.to_string(),
        DlmsValue::Int16(v) => v.to_string(),
        DlmsValue::Uint8(v) => v.to_string(),
        DlmsValue::Uint16(v) => v.to_string(),
        DlmsValue::Int64(v) => v.to_string(),
        DlmsValue::Uint64(v) => v.to_string(),
        DlmsValue::Enum(v) => v.to_string(),
        DlmsValue::Float32(v) => v.to_string(),
        DlmsValue::Float64(v) => v.to_string(),
        DlmsValue::DateTime(v) => v.to_string(),
        DlmsValue::OctetString(bytes) => format!("'{}'", hex::encode(bytes)),
        DlmsValue::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn load_primary_routes(&self, gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        let rows = sqlx::query(
            "SELECT meter_mac_address, source_route_path FROM source_route_network WHERE gateway_id = ?",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sql_err("load_primary_routes", e))?;

        rows.into_iter()
            .map(|row| path_row_from(row))
            .collect::<Result<Vec<_>, _>>()
    }

    async fn load_alternate_routes(&self, gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        let rows = sqlx::query(
            "SELECT meter_mac_address, source_route_path FROM alternate_source_route_network WHERE gateway_id = ?",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sql_err("load_alternate_routes", e))?;

        rows.into_iter()
            .map(|row| path_row_from(row))
            .collect::<Result<Vec<_>, _>>()
    }

    async fn missing_cycle_info(
        &self,
        gateway_id: &str,
        mac: [u8; 8],
        current_cycle_id: u8,
    ) -> Result<MissingCycleInfo, EngineError> {
        let mac_hex = Self::mac_hex(mac);

        let silenced: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM silenced_nodes_for_fuota \
             WHERE gateway_id = ? AND meter_mac_address = ? AND Fuota_status = 1",
        )
        .bind(gateway_id)
        .bind(&mac_hex)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sql_err("missing_cycle_info:silenced", e))?
        .get("n");

        if silenced > 0 {
            return Ok(MissingCycleInfo { is_silenced: true, ..Default::default() });
        }

        let nameplate_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM name_plate_data WHERE gateway_id = ? AND meter_mac_address = ?",
        )
        .bind(gateway_id)
        .bind(&mac_hex)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sql_err("missing_cycle_info:nameplate", e))?
        .get("n");

        let row = sqlx::query(
            "SELECT \
               EXISTS(SELECT 1 FROM dlms_ip_push_data WHERE gateway_id=? AND meter_mac_address=? AND cycle_id=?) AS has_ip, \
               EXISTS(SELECT 1 FROM dlms_daily_load_push_profile WHERE gateway_id=? AND meter_mac_address=? AND DATE(real_time_clock)=CURDATE() - INTERVAL 1 DAY) AS has_dlp, \
               EXISTS(SELECT 1 FROM dlms_block_load_push_profile WHERE gateway_id=? AND meter_mac_address=? AND cycle_id=?) AS has_blp, \
               EXISTS(SELECT 1 FROM dlms_history_data WHERE gateway_id=? AND meter_mac_address=? AND MONTH(billing_date_import_mode)=MONTH(CURDATE() - INTERVAL 1 MONTH)) AS has_bhp, \
               EXISTS(SELECT 1 FROM meter_details WHERE gateway_id=? AND meter_mac_address=? AND rf_module_internal_fw_version IS NOT NULL) AS has_ifv",
        )
        .bind(gateway_id)
        .bind(&mac_hex)
        .bind(current_cycle_id)
        .bind(gateway_id)
        .bind(&mac_hex)
        .bind(gateway_id)
        .bind(&mac_hex)
        .bind(current_cycle_id)
        .bind(gateway_id)
        .bind(&mac_hex)
        .bind(gateway_id)
        .bind(&mac_hex)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sql_err("missing_cycle_info:profiles", e))?;

        let has_ip: bool = row.get("has_ip");
        let has_dlp: bool = row.get("has_dlp");
        let has_blp: bool = row.get("has_blp");
        let has_bhp: bool = row.get("has_bhp");
        let has_ifv: bool = row.get("has_ifv");

        Ok(MissingCycleInfo {
            missing_ip_cycles: if has_ip { Vec::new() } else { vec![current_cycle_id] },
            missing_blp_last_hour: !has_blp,
            missing_dlp_yesterday: !has_dlp,
            missing_bhp_last_month: !has_bhp,
            missing_nameplate: nameplate_count == 0,
            missing_ifv: !has_ifv,
            is_silenced: false,
        })
    }

    async fn append_nameplate(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.append_fields("name_plate_data", batch).await
    }

    async fn upsert_meter_details(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        // original_source updates if a row already exists for (gateway, mac),
        // otherwise inserts (database.cpp's insert_name_plate_data path).
        let mac_hex = Self::mac_hex(batch.mac);
        let exists: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM meter_details WHERE gateway_id = ? AND meter_mac_address = ?",
        )
        .bind(&batch.gateway_id)
        .bind(&mac_hex)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sql_err("upsert_meter_details:exists", e))?
        .get("n");

        if exists > 0 {
            for (column, value) in &batch.fields {
                let sql = format!(
                    "UPDATE meter_details SET {column} = {} WHERE gateway_id = ? AND meter_mac_address = ?",
                    scalar_value_sql(value)
                );
                sqlx::query(&sql)
                    .bind(&batch.gateway_id)
                    .bind(&mac_hex)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Self::sql_err("upsert_meter_details:update", e))?;
            }
            Ok(())
        } else {
            self.append_fields("meter_details", batch).await
        }
    }

    async fn append_ip_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.append_fields("dlms_ip_push_data", batch).await
    }

    async fn append_dlp_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.append_fields("dlms_daily_load_push_profile", batch).await
    }

    async fn append_blp_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.append_fields("dlms_block_load_push_profile", batch).await
    }

    async fn append_history(&self, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.append_fields("dlms_history_data", batch).await
    }

    async fn set_request_status(
        &self,
        request_id: u64,
        status: RequestStatus,
        error_code: Option<u16>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE dlms_on_demand_request SET status = ?, error_code = ?, download_time = NOW() \
             WHERE request_id = ?",
        )
        .bind(status as i64)
        .bind(error_code.map(|c| c as i64))
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sql_err("set_request_status", e))?;
        Ok(())
    }

    async fn set_fuota_status(&self, gateway_id: &str, mac: [u8; 8], phase: u8) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE dlms_fuota_upload SET status = ? WHERE gateway_id = ? AND meter_mac_address = ?",
        )
        .bind(phase as i64)
        .bind(gateway_id)
        .bind(Self::mac_hex(mac))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sql_err("set_fuota_status", e))?;
        Ok(())
    }

    async fn record_silenced(&self, gateway_id: &str, mac: [u8; 8]) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO silenced_nodes_for_fuota (gateway_id, meter_mac_address, Fuota_status) \
             VALUES (?, ?, 1) \
             ON DUPLICATE KEY UPDATE Fuota_status = 1, last_update_time = NOW()",
        )
        .bind(gateway_id)
        .bind(Self::mac_hex(mac))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sql_err("record_silenced", e))?;
        Ok(())
    }

    async fn record_unsilenced(&self, gateway_id: &str, mac: [u8; 8]) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO unsilenced_nodes_for_fuota (gateway_id, meter_mac_address, Fuota_status) \
             VALUES (?, ?, 0) \
             ON DUPLICATE KEY UPDATE Fuota_status = 0, last_update_time = NOW()",
        )
        .bind(gateway_id)
        .bind(Self::mac_hex(mac))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sql_err("record_unsilenced", e))?;
        Ok(())
    }

    async fn silenced_nodes(&self, gateway_id: &str) -> Result<Vec<[u8; 8]>, EngineError> {
        let rows = sqlx::query(
            "SELECT meter_mac_address FROM silenced_nodes_for_fuota WHERE gateway_id = ? AND Fuota_status = 1",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sql_err("silenced_nodes", e))?;

        rows.into_iter()
            .map(|row| mac_from_hex(row.get::<String, _>("meter_mac_address")))
            .collect::<Result<Vec<_>, _>>()
    }

    async fn try_acquire_sync(&self, gateway_id: &str) -> Result<bool, EngineError> {
        // `hes_nms_sync_time` holds a single flag row per gateway; acquiring
        // means flipping it from the peer controller's hold to ours.
        let result = sqlx::query(
            "UPDATE hes_nms_sync_time SET held_by = 'HES', acquired_time = NOW() \
             WHERE gateway_id = ? AND held_by != 'HES'",
        )
        .bind(gateway_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sql_err("try_acquire_sync", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let already_ours: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM hes_nms_sync_time WHERE gateway_id = ? AND held_by = 'HES'",
        )
        .bind(gateway_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sql_err("try_acquire_sync:check", e))?
        .get("n");

        Ok(already_ours > 0)
    }

    async fn recent_fuota_resume(
        &self,
        gateway_id: &str,
        within_secs: u64,
    ) -> Result<Option<FuotaResumeRecord>, EngineError> {
        let row = sqlx::query(
            "SELECT meter_mac_address, firmware_path FROM dlms_fuota_upload \
             WHERE gateway_id = ? AND status NOT IN (0, 1) \
               AND last_update_time >= NOW() - INTERVAL ? SECOND \
             ORDER BY last_update_time DESC LIMIT 1",
        )
        .bind(gateway_id)
        .bind(within_secs as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sql_err("recent_fuota_resume", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let mac = mac_from_hex(row.get::<String, _>("meter_mac_address"))?;
                let firmware_path: String = row.get("firmware_path");
                Ok(Some(FuotaResumeRecord { target_mac: mac, firmware_path }))
            }
        }
    }
}

impl MySqlStore {
    async fn append_fields(&self, table: &str, batch: ProfileRecordBatch) -> Result<(), EngineError> {
        if batch.fields.is_empty() {
            warn!(table, "append_fields called with no columns, skipping insert");
            return Ok(());
        }
        let columns: Vec<&str> = std::iter::once("gateway_id")
            .chain(std::iter::once("meter_mac_address"))
            .chain(std::iter::once("cycle_id"))
            .chain(batch.fields.iter().map(|(name, _)| name.as_str()))
            .collect();
        let mut values: Vec<String> = vec![
            format!("'{}'", batch.gateway_id),
            format!("'{}'", Self::mac_hex(batch.mac)),
            batch.cycle_id.to_string(),
        ];
        values.extend(batch.fields.iter().map(|(_, v)| scalar_value_sql(v)));

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        );
        sqlx::query::<MySql>(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sql_err("append_fields", e))?;
        Ok(())
    }
}

fn mac_from_hex(hex_str: String) -> Result<[u8; 8], EngineError> {
    let bytes = hex::decode(&hex_str)
        .map_err(|_| EngineError::WireFormat(hes_core::error::WireFormatError::LengthMismatch))?;
    if bytes.len() != 8 {
        return Err(EngineError::WireFormat(hes_core::error::WireFormatError::LengthMismatch));
    }
    let mut mac = [0u8; 8];
    mac.copy_from_slice(&bytes);
    Ok(mac)
}

fn path_row_from(row: sqlx::mysql::MySqlRow) -> Result<PathRow, EngineError> {
    let mac_hex: String = row.get("meter_mac_address");
    let path_hex: String = row.get("source_route_path");
    let mac = mac_from_hex(mac_hex)?;
    let path_bytes = hex::decode(&path_hex)
        .map_err(|_| EngineError::WireFormat(hes_core::error::WireFormatError::LengthMismatch))?;
    Ok(PathRow { mac, path: RawPath { path_bytes } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_hex_round_trips_through_mac_from_hex() {
        let mac = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33];
        let hex_str = MySqlStore::mac_hex(mac);
        assert_eq!(hex_str, "DEADBEEF00112233");
        assert_eq!(mac_from_hex(hex_str).unwrap(), mac);
    }

    #[test]
    fn mac_from_hex_rejects_wrong_length() {
        assert!(mac_from_hex("AABB".to_string()).is_err());
    }

    #[test]
    fn scalar_value_sql_escapes_quotes_and_encodes_octet_strings() {
        assert_eq!(scalar_value_sql(&DlmsValue::None), "NULL");
        assert_eq!(scalar_value_sql(&DlmsValue::Int32(-7)), "-7");
        assert_eq!(
            scalar_value_sql(&DlmsValue::String("O'Brien".to_string())),
            "'O''Brien'"
        );
        assert_eq!(
            scalar_value_sql(&DlmsValue::OctetString(vec![0xAB, 0xCD])),
            "'abcd'"
        );
    }
}
