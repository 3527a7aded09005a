use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DeviceRecord {
    pub mac_address: String,
    pub ip_address: String,
    pub requires_training: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub mac_address: String,
    pub ip_address: String,
    pub label: String,
}

impl DeviceAssignment {
    /// Doors gate entry, not equipment, so they carry no training requirement.
    pub fn requires_training(&self) -> bool {
        !self.label.to_lowercase().contains("door")
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    pool: SqlitePool,
}

impl DeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn register_device(&self, mac_address: &str, ip_address: &str) -> Result<(), StoreError> {
        let mac = normalize_mac(mac_address);
        sqlx::query(
            "INSERT INTO devices (mac_address, ip_address) VALUES (?1, ?2)
             ON CONFLICT (mac_address) DO UPDATE SET ip_address = excluded.ip_address",
        )
        .bind(&mac)
        .bind(ip_address.trim())
        .execute(&self.pool)
        .await?;
        info!(mac_address = %mac, "device registered");
        Ok(())
    }

    pub async fn assign_labels(&self, assignments: &[DeviceAssignment]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for assignment in assignments {
            let mac = normalize_mac(&assignment.mac_address);
            sqlx::query(
                "INSERT INTO devices (mac_address, ip_address, requires_training) VALUES (?1, ?2, ?3)
                 ON CONFLICT (mac_address) DO UPDATE SET
                     ip_address = excluded.ip_address,
                     requires_training = excluded.requires_training",
            )
            .bind(&mac)
            .bind(assignment.ip_address.trim())
            .bind(assignment.requires_training())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO device_label_links (mac_address, label) VALUES (?1, ?2)
                 ON CONFLICT (mac_address) DO UPDATE SET label = excluded.label",
            )
            .bind(&mac)
            .bind(assignment.label.trim())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(assignments.len())
    }

    pub async fn devices_with_labels(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DeviceRecord>(
            "SELECT d.mac_address, d.ip_address, d.requires_training, l.label
             FROM devices d
             LEFT JOIN device_label_links l ON l.mac_address = d.mac_address
             ORDER BY d.mac_address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn normalize_mac(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconciliationStore;

    #[test]
    fn door_labels_do_not_require_training() {
        let door = DeviceAssignment {
            mac_address: "aa".into(),
            ip_address: "10.0.0.2".into(),
            label: "Front Door".into(),
        };
        let lathe = DeviceAssignment {
            label: "Lathe".into(),
            ..door.clone()
        };
        assert!(!door.requires_training());
        assert!(lathe.requires_training());
    }

    #[tokio::test]
    async fn assignments_replace_previous_label() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let registry = store.devices();

        registry.register_device("AA:BB:CC:00:11:22", "10.0.0.5").await.unwrap();
        let listed = registry.devices_with_labels().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].mac_address, "aa:bb:cc:00:11:22");
        assert_eq!(listed[0].label, None);
        assert!(listed[0].requires_training);

        let assign = |label: &str| DeviceAssignment {
            mac_address: "aa:bb:cc:00:11:22".into(),
            ip_address: "10.0.0.6".into(),
            label: label.into(),
        };
        registry.assign_labels(&[assign("Laser")]).await.unwrap();
        registry.assign_labels(&[assign("Shop Door")]).await.unwrap();

        let listed = registry.devices_with_labels().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip_address, "10.0.0.6");
        assert_eq!(listed[0].label.as_deref(), Some("Shop Door"));
        assert!(!listed[0].requires_training);
    }
}
