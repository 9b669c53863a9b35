use crate::store::operations::deliveries::{DeliveryRecord, DeliveryStatus};
use crate::store::operations::papers::Paper;
use crate::store::{keys, Store, StoreError};

const VERSION_KEY: &str = "_meta:version";

type MigrationFn = fn(&Store) -> Result<(), StoreError>;

fn migrations() -> Vec<(&'static str, MigrationFn)> {
    vec![
        ("001_initial", m001_initial),
        ("002_papers_by_added_index", m002_papers_by_added_index),
        (
            "003_deliveries_by_recipient_index",
            m003_deliveries_by_recipient_index,
        ),
    ]
}

/// 执行所有未应用的数据库迁移。
///
/// - 每个迁移必须幂等：进程可能在迁移完成后、写入版本号前崩溃，重启后会重跑。
/// - 版本号在每个迁移成功后立即持久化。
/// - 仅向前，拒绝降级。
pub fn run(store: &Store) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    let all = migrations();

    for (index, (name, func)) in all.iter().enumerate() {
        let version = (index + 1) as u32;
        if version > current {
            tracing::info!(version, name, "Running migration");
            func(store)?;
            set_version(store, version)?;
            tracing::info!(version, name, "Migration complete");
        } else {
            tracing::debug!(version, name, "Migration already applied, skipping");
        }
    }

    Ok(())
}

pub fn latest_version() -> u32 {
    migrations().len() as u32
}

pub fn get_current_version(store: &Store) -> Result<u32, StoreError> {
    match store.meta.get(VERSION_KEY.as_bytes())? {
        Some(raw) if raw.len() == 4 => {
            let bytes: [u8; 4] = raw.as_ref().try_into().unwrap_or([0; 4]);
            Ok(u32::from_be_bytes(bytes))
        }
        Some(raw) => Err(StoreError::Migration {
            version: 0,
            message: format!("corrupt version marker ({} bytes)", raw.len()),
        }),
        None => Ok(0),
    }
}

pub fn set_version(store: &Store, version: u32) -> Result<(), StoreError> {
    let current = get_current_version(store)?;
    if version < current {
        return Err(StoreError::Migration {
            version,
            message: format!("Refuse to downgrade from {} to {}", current, version),
        });
    }

    store
        .meta
        .insert(VERSION_KEY.as_bytes(), &version.to_be_bytes())?;
    Ok(())
}

fn m001_initial(_store: &Store) -> Result<(), StoreError> {
    Ok(())
}

/// Rebuild the added-at index for papers written before the index existed.
fn m002_papers_by_added_index(store: &Store) -> Result<(), StoreError> {
    for item in store.papers.iter() {
        let (_, value) = item?;
        let paper: Paper = Store::deserialize(&value)?;
        let index_key =
            keys::paper_added_index_key(paper.added_at.timestamp_millis(), &paper.arxiv_id)?;
        store
            .papers_by_added
            .insert(index_key.as_bytes(), paper.arxiv_id.as_bytes())?;
    }
    Ok(())
}

fn m003_deliveries_by_recipient_index(store: &Store) -> Result<(), StoreError> {
    for item in store.deliveries.iter() {
        let (_, value) = item?;
        let record: DeliveryRecord = Store::deserialize(&value)?;
        if record.status != DeliveryStatus::Delivered {
            continue;
        }
        let Some(notified_at) = record.notified_at else {
            continue;
        };
        let index_key = keys::recipient_delivery_key(
            record.recipient.platform.as_str(),
            &record.recipient.chat_id,
            notified_at.timestamp_millis(),
            &record.arxiv_id,
        )?;
        store
            .deliveries_by_recipient
            .insert(index_key.as_bytes(), record.arxiv_id.as_bytes())?;
    }
    Ok(())
}
