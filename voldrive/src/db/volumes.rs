//! Volume records.

use rusqlite::{OptionalExtension, params};
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use super::{Database, db_err};
use crate::driver::{AttachmentState, Volume};

#[derive(Clone, Debug)]
pub struct VolumeStore {
    db: Database,
}

impl VolumeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new volume; names are unique.
    pub fn insert(&self, volume: &Volume) -> VoldriveResult<()> {
        let blob = serde_json::to_string(volume)?;
        let conn = self.db.conn();

        let taken: Option<String> = db_err!(
            conn.query_row(
                "SELECT id FROM volumes WHERE name = ?1",
                params![volume.name],
                |row| row.get(0),
            )
            .optional()
        )?;
        if let Some(id) = taken {
            return Err(VoldriveError::AlreadyExists(format!(
                "volume {} (id {})",
                volume.name, id
            )));
        }

        db_err!(conn.execute(
            "INSERT INTO volumes (id, name, attached_to, created_at, volume) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                volume.id,
                volume.name,
                attached_to(volume),
                volume.created_at.to_rfc3339(),
                blob
            ],
        ))?;
        Ok(())
    }

    /// Look up by id, then by name.
    pub fn get(&self, id_or_name: &str) -> VoldriveResult<Option<Volume>> {
        let conn = self.db.conn();
        let blob: Option<String> = db_err!(
            conn.query_row(
                "SELECT volume FROM volumes WHERE id = ?1 OR name = ?1 ORDER BY (id = ?1) DESC LIMIT 1",
                params![id_or_name],
                |row| row.get(0),
            )
            .optional()
        )?;
        blob.map(|b| serde_json::from_str(&b).map_err(VoldriveError::from))
            .transpose()
    }

    pub fn require(&self, id_or_name: &str) -> VoldriveResult<Volume> {
        self.get(id_or_name)?
            .ok_or_else(|| VoldriveError::NotFound(format!("volume {}", id_or_name)))
    }

    /// All volumes, oldest first.
    pub fn list(&self) -> VoldriveResult<Vec<Volume>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT volume FROM volumes ORDER BY created_at, name"))?;
        let rows = db_err!(stmt.query_map([], |row| row.get::<_, String>(0)))?;

        let mut volumes = Vec::new();
        for row in rows {
            let blob = db_err!(row)?;
            volumes.push(serde_json::from_str(&blob)?);
        }
        Ok(volumes)
    }

    /// Volumes attached to `instance_id`.
    pub fn attached_to(&self, instance_id: &str) -> VoldriveResult<Vec<Volume>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT volume FROM volumes WHERE attached_to = ?1 ORDER BY created_at, name"
        ))?;
        let rows = db_err!(stmt.query_map(params![instance_id], |row| row.get::<_, String>(0)))?;

        let mut volumes = Vec::new();
        for row in rows {
            volumes.push(serde_json::from_str(&db_err!(row)?)?);
        }
        Ok(volumes)
    }

    pub fn update(&self, volume: &Volume) -> VoldriveResult<()> {
        let blob = serde_json::to_string(volume)?;
        let changed = db_err!(self.db.conn().execute(
            "UPDATE volumes SET name = ?2, attached_to = ?3, volume = ?4 WHERE id = ?1",
            params![volume.id, volume.name, attached_to(volume), blob],
        ))?;
        if changed == 0 {
            return Err(VoldriveError::NotFound(format!("volume {}", volume.id)));
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: &str) -> VoldriveResult<bool> {
        let changed = db_err!(self
            .db
            .conn()
            .execute("DELETE FROM volumes WHERE id = ?1", params![id]))?;
        Ok(changed > 0)
    }
}

fn attached_to(volume: &Volume) -> Option<&str> {
    volume
        .attachments
        .iter()
        .find(|a| a.state == AttachmentState::Attached)
        .map(|a| a.instance_id.id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VolumeAttachment;
    use chrono::Utc;
    use tempfile::TempDir;
    use voldrive_shared::executor::InstanceId;

    fn store() -> (VolumeStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(&tmp.path().join("vfs.db")).unwrap();
        (VolumeStore::new(db), tmp)
    }

    fn volume(id: &str, name: &str) -> Volume {
        Volume {
            id: id.into(),
            name: name.into(),
            size_gb: Some(1),
            volume_type: None,
            iops: None,
            availability_zone: None,
            encrypted: false,
            attachments: Vec::new(),
            fields: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_get_by_id_or_name() {
        let (store, _tmp) = store();
        store.insert(&volume("01A", "data")).unwrap();

        assert_eq!(store.require("01A").unwrap().name, "data");
        assert_eq!(store.require("data").unwrap().id, "01A");
        assert!(store.get("nope").unwrap().is_none());
        assert!(matches!(store.require("nope"), Err(VoldriveError::NotFound(_))));
    }

    #[test]
    fn test_id_match_wins_over_name_match() {
        let (store, _tmp) = store();
        store.insert(&volume("a", "b")).unwrap();
        store.insert(&volume("b", "c")).unwrap();
        assert_eq!(store.require("b").unwrap().id, "b");
    }

    #[test]
    fn test_duplicate_name() {
        let (store, _tmp) = store();
        store.insert(&volume("1", "data")).unwrap();
        assert!(matches!(
            store.insert(&volume("2", "data")),
            Err(VoldriveError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_tracks_attachment() {
        let (store, _tmp) = store();
        let mut v = volume("1", "data");
        store.insert(&v).unwrap();

        v.attachments.push(VolumeAttachment {
            volume_id: "1".into(),
            instance_id: InstanceId::new("host-a", "vfs"),
            device_name: Some("/dev/x".into()),
            mount_point: None,
            state: AttachmentState::Attached,
        });
        store.update(&v).unwrap();
        assert_eq!(store.attached_to("host-a").unwrap().len(), 1);
        assert!(store.attached_to("host-b").unwrap().is_empty());

        assert!(store.delete("1").unwrap());
        assert!(!store.delete("1").unwrap());
        assert!(matches!(store.update(&v), Err(VoldriveError::NotFound(_))));
    }

    #[test]
    fn test_list_in_creation_order() {
        let (store, _tmp) = store();
        store.insert(&volume("1", "first")).unwrap();
        store.insert(&volume("2", "second")).unwrap();
        let names: Vec<_> = store.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
