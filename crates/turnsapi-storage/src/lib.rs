pub mod db;
pub mod entities;
pub mod seaorm;
pub mod storage;

pub use seaorm::SeaOrmStorage;
pub use storage::{
    ApiKeyRecord, GroupSelectionConfig, NewProxyKey, NewRequestLog, ProviderGroup, ProxyKey,
    ProxyKeyUpdate, RequestLog, RequestLogFilter, RequestParamOverrides, RotationStrategy,
    Storage, StorageError, StorageResult,
};
