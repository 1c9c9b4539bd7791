//! SQLite-Implementierung des GroupStore (Mitglieder und Gruppen-Roster)

use async_trait::async_trait;
use chrono::Utc;
use encore_core::{GroupId, MemberId};
use encore_crypto::PublicKey;
use encore_protocol::Visibility;
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::sqlite::envelopes::{millis_zu_zeit, parse_id, zu_i64, zu_u64};
use crate::sqlite::pool::SqliteDb;
use crate::store::{GroupAction, GroupEvent, GroupRecord, GroupStore, MemberRecord};

#[async_trait]
impl GroupStore for SqliteDb {
    async fn mitglied_speichern(&self, member: &MemberRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO members (id, display_handle, public_key, registered_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET display_handle = excluded.display_handle",
        )
        .bind(member.id.inner().to_string())
        .bind(&member.display_handle)
        .bind(member.public_key.as_bytes().as_slice())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alle_mitglieder(&self) -> DbResult<Vec<MemberRecord>> {
        let rows = sqlx::query(
            "SELECT id, display_handle, public_key FROM members ORDER BY registered_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let key: Vec<u8> = row.try_get("public_key")?;
                Ok(MemberRecord {
                    id: parse_id(row, "id")?,
                    display_handle: row.try_get("display_handle")?,
                    public_key: PublicKey::from_slice(&key)
                        .map_err(|e| DbError::ungueltig(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn gruppe_anlegen(&self, group: &GroupRecord) -> DbResult<()> {
        let id_str = group.id.inner().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO groups (id, creator_id, visibility, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id_str)
        .bind(group.creator.inner().to_string())
        .bind(sichtbarkeit_als_str(group.visibility))
        .bind(group.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for (position, member) in group.initial_members.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO group_initial_members (group_id, member_id, position)
                 VALUES (?, ?, ?)",
            )
            .bind(&id_str)
            .bind(member.inner().to_string())
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(group_id = %group.id, mitglieder = group.initial_members.len() + 1, "Gruppe gespeichert");
        Ok(())
    }

    async fn ereignis_anhaengen(&self, event: &GroupEvent) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO group_events (group_id, epoch, caller_id, action, member_id, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.group_id.inner().to_string())
        .bind(zu_i64(event.epoch)?)
        .bind(event.caller.inner().to_string())
        .bind(event.action.als_str())
        .bind(event.action.member().map(|m| m.inner().to_string()))
        .bind(event.at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        debug!(group_id = %event.group_id, epoch = event.epoch, action = event.action.als_str(), "Gruppen-Ereignis gespeichert");
        Ok(())
    }

    async fn alle_gruppen(&self) -> DbResult<Vec<GroupRecord>> {
        let rows = sqlx::query(
            "SELECT id, creator_id, visibility, created_at FROM groups ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut gruppen = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: GroupId = parse_id(row, "id")?;
            let sichtbarkeit: String = row.try_get("visibility")?;

            let mitglieder = sqlx::query(
                "SELECT member_id FROM group_initial_members WHERE group_id = ? ORDER BY position",
            )
            .bind(id.inner().to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| parse_id::<MemberId>(r, "member_id"))
            .collect::<DbResult<Vec<_>>>()?;

            gruppen.push(GroupRecord {
                id,
                creator: parse_id(row, "creator_id")?,
                visibility: sichtbarkeit_aus_str(&sichtbarkeit)?,
                initial_members: mitglieder,
                created_at: millis_zu_zeit(row.try_get("created_at")?)?,
            });
        }
        Ok(gruppen)
    }

    async fn ereignisse(&self, group_id: GroupId) -> DbResult<Vec<GroupEvent>> {
        let rows = sqlx::query(
            "SELECT group_id, epoch, caller_id, action, member_id, at FROM group_events
             WHERE group_id = ? ORDER BY epoch",
        )
        .bind(group_id.inner().to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &SqliteRow) -> DbResult<GroupEvent> {
    let action: String = row.try_get("action")?;
    let member_spalte: Option<String> = row.try_get("member_id")?;
    let member = || -> DbResult<MemberId> {
        member_spalte
            .as_deref()
            .ok_or_else(|| DbError::ungueltig(format!("Ereignis '{action}' ohne member_id")))?
            .parse()
            .map_err(|e| DbError::ungueltig(format!("Ungueltige member_id: {e}")))
    };
    let action = match action.as_str() {
        "add" => GroupAction::Add(member()?),
        "remove" => GroupAction::Remove(member()?),
        "promote" => GroupAction::Promote(member()?),
        "demote" => GroupAction::Demote(member()?),
        "dissolve" => GroupAction::Dissolve,
        andere => return Err(DbError::ungueltig(format!("Unbekannte Aktion: {andere}"))),
    };
    Ok(GroupEvent {
        group_id: parse_id(row, "group_id")?,
        epoch: zu_u64(row.try_get("epoch")?)?,
        caller: parse_id(row, "caller_id")?,
        action,
        at: millis_zu_zeit(row.try_get("at")?)?,
    })
}

fn sichtbarkeit_als_str(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Private => "private",
        Visibility::Public => "public",
    }
}

fn sichtbarkeit_aus_str(s: &str) -> DbResult<Visibility> {
    match s {
        "private" => Ok(Visibility::Private),
        "public" => Ok(Visibility::Public),
        andere => Err(DbError::ungueltig(format!("Unbekannte Sichtbarkeit: {andere}"))),
    }
}
