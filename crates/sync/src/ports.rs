use std::sync::Arc;

use lumen_db::bulk_jobs::pg_repository::PgBulkJobRepository;
use lumen_db::bulk_jobs::repositories::BulkJobRepository;
use lumen_db::connections::pg_repository::PgConnectionRepository;
use lumen_db::connections::repositories::ConnectionRepository;
use lumen_db::memory::MemoryStore;
use lumen_db::records::pg_repository::PgRecordStore;
use lumen_db::records::repositories::RecordStore;
use sqlx::PgPool;

use crate::platform::PlatformApi;

/// The platform client and storage repositories the engine runs against.
#[derive(Clone)]
pub struct SyncPorts {
    pub api: Arc<dyn PlatformApi>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub jobs: Arc<dyn BulkJobRepository>,
    pub records: Arc<dyn RecordStore>,
}

impl SyncPorts {
    pub fn postgres(api: Arc<dyn PlatformApi>, pool: PgPool) -> Self {
        Self {
            api,
            connections: Arc::new(PgConnectionRepository::new(pool.clone())),
            jobs: Arc::new(PgBulkJobRepository::new(pool.clone())),
            records: Arc::new(PgRecordStore::new(pool)),
        }
    }

    pub fn in_memory(api: Arc<dyn PlatformApi>, store: MemoryStore) -> Self {
        Self {
            api,
            connections: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            records: Arc::new(store),
        }
    }
}
