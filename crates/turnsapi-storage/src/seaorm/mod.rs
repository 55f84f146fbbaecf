use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Condition, ConnectionTrait, Database,
    DatabaseBackend, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use time::OffsetDateTime;

use crate::entities;
use crate::storage::{
    ApiKeyRecord, NewProxyKey, NewRequestLog, ProviderGroup, ProxyKey, ProxyKeyUpdate,
    RequestLog, RequestLogFilter, RotationStrategy, Storage, StorageError, StorageResult,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn rotation_strategy_to_str(s: RotationStrategy) -> &'static str {
    match s {
        RotationStrategy::RoundRobin => "round_robin",
        RotationStrategy::Random => "random",
        RotationStrategy::LeastUsed => "least_used",
    }
}

fn rotation_strategy_from_str(s: &str) -> RotationStrategy {
    match s {
        "random" => RotationStrategy::Random,
        "least_used" => RotationStrategy::LeastUsed,
        _ => RotationStrategy::RoundRobin,
    }
}

fn headers_to_json(headers: &[(String, String)]) -> serde_json::Value {
    serde_json::Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn headers_from_json(value: &serde_json::Value) -> Vec<(String, String)> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn group_model_to_domain(
    model: entities::provider_groups::Model,
    keys: Vec<entities::provider_api_keys::Model>,
) -> StorageResult<ProviderGroup> {
    let models: Vec<String> = serde_json::from_value(model.models)?;
    let request_params = model
        .request_params
        .map(serde_json::from_value)
        .transpose()?;
    Ok(ProviderGroup {
        group_id: model.group_id,
        name: model.name,
        provider_type: model.provider_type,
        base_url: model.base_url,
        enabled: model.enabled,
        timeout_seconds: model.timeout_seconds,
        max_retries: model.max_retries,
        rotation_strategy: rotation_strategy_from_str(&model.rotation_strategy),
        models,
        headers: headers_from_json(&model.headers),
        request_params,
        keys: keys
            .into_iter()
            .map(|k| ApiKeyRecord {
                id: k.id,
                group_id: k.group_id,
                api_key: k.api_key,
                key_order: k.key_order,
                is_valid: k.is_valid,
                last_validated_at: k.last_validated_at,
                validation_error: k.validation_error,
                created_at: k.created_at,
            })
            .collect(),
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn proxy_key_model_to_domain(model: entities::proxy_keys::Model) -> StorageResult<ProxyKey> {
    let allowed_groups: Vec<String> = serde_json::from_value(model.allowed_groups)?;
    let group_selection_config = model
        .group_selection_config
        .map(serde_json::from_value)
        .transpose()?;
    Ok(ProxyKey {
        id: model.id,
        name: model.name,
        description: model.description,
        key: model.key,
        allowed_groups,
        group_selection_config,
        is_active: model.is_active,
        usage_count: model.usage_count,
        created_at: model.created_at,
        updated_at: model.updated_at,
        last_used_at: model.last_used_at,
    })
}

fn request_log_model_to_domain(model: entities::request_logs::Model) -> RequestLog {
    RequestLog {
        id: model.id,
        proxy_key_name: model.proxy_key_name,
        proxy_key_id: model.proxy_key_id,
        provider_group: model.provider_group,
        openrouter_key: model.openrouter_key,
        model: model.model,
        request_body: model.request_body,
        response_body: model.response_body,
        status_code: model.status_code,
        is_stream: model.is_stream,
        duration: model.duration,
        tokens_used: model.tokens_used,
        tokens_estimated: model.tokens_estimated,
        error: model.error,
        client_ip: model.client_ip,
        created_at: model.created_at,
        has_tool_calls: model.has_tool_calls,
        tool_calls_count: model.tool_calls_count,
        tool_names: model.tool_names,
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ProviderGroups)
            .register(entities::ProviderApiKeys)
            .register(entities::ProxyKeys)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn list_groups(&self) -> StorageResult<Vec<ProviderGroup>> {
        let groups = entities::ProviderGroups::find().all(&self.db).await?;
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            let keys = entities::ProviderApiKeys::find()
                .filter(entities::provider_api_keys::Column::GroupId.eq(group.group_id.clone()))
                .order_by_asc(entities::provider_api_keys::Column::KeyOrder)
                .all(&self.db)
                .await?;
            out.push(group_model_to_domain(group, keys)?);
        }
        Ok(out)
    }

    async fn load_group(&self, group_id: &str) -> StorageResult<Option<ProviderGroup>> {
        let Some(group) = entities::ProviderGroups::find_by_id(group_id.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let keys = entities::ProviderApiKeys::find()
            .filter(entities::provider_api_keys::Column::GroupId.eq(group_id))
            .order_by_asc(entities::provider_api_keys::Column::KeyOrder)
            .all(&self.db)
            .await?;
        Ok(Some(group_model_to_domain(group, keys)?))
    }

    async fn save_group(&self, group: &ProviderGroup) -> StorageResult<()> {
        self.update_group(group).await
    }

    async fn update_group(&self, group: &ProviderGroup) -> StorageResult<()> {
        use entities::provider_groups::ActiveModel as GroupActive;

        let active = GroupActive {
            group_id: ActiveValue::Set(group.group_id.clone()),
            name: ActiveValue::Set(group.name.clone()),
            provider_type: ActiveValue::Set(group.provider_type.clone()),
            base_url: ActiveValue::Set(group.base_url.clone()),
            enabled: ActiveValue::Set(group.enabled),
            timeout_seconds: ActiveValue::Set(group.timeout_seconds),
            max_retries: ActiveValue::Set(group.max_retries),
            rotation_strategy: ActiveValue::Set(
                rotation_strategy_to_str(group.rotation_strategy).to_string(),
            ),
            models: ActiveValue::Set(serde_json::to_value(&group.models)?),
            headers: ActiveValue::Set(headers_to_json(&group.headers)),
            request_params: ActiveValue::Set(
                group
                    .request_params
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            ),
            created_at: ActiveValue::Set(group.created_at),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };

        let existing = entities::ProviderGroups::find_by_id(group.group_id.clone())
            .one(&self.db)
            .await?;
        if existing.is_some() {
            entities::ProviderGroups::update(active)
                .filter(entities::provider_groups::Column::GroupId.eq(group.group_id.clone()))
                .exec(&self.db)
                .await?;
        } else {
            entities::ProviderGroups::insert(active)
                .exec(&self.db)
                .await?;
        }

        entities::ProviderApiKeys::delete_many()
            .filter(entities::provider_api_keys::Column::GroupId.eq(group.group_id.clone()))
            .exec(&self.db)
            .await?;
        for key in &group.keys {
            let key_active = entities::provider_api_keys::ActiveModel {
                id: ActiveValue::NotSet,
                group_id: ActiveValue::Set(group.group_id.clone()),
                api_key: ActiveValue::Set(key.api_key.clone()),
                key_order: ActiveValue::Set(key.key_order),
                is_valid: ActiveValue::Set(key.is_valid),
                last_validated_at: ActiveValue::Set(key.last_validated_at),
                validation_error: ActiveValue::Set(key.validation_error.clone()),
                created_at: ActiveValue::Set(key.created_at),
            };
            entities::ProviderApiKeys::insert(key_active)
                .exec(&self.db)
                .await?;
        }

        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> StorageResult<()> {
        entities::ProviderGroups::delete_by_id(group_id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn toggle_group(&self, group_id: &str, enabled: bool) -> StorageResult<()> {
        let Some(model) = entities::ProviderGroups::find_by_id(group_id.to_string())
            .one(&self.db)
            .await?
        else {
            return Err(StorageError::NotFound);
        };
        let mut active: entities::provider_groups::ActiveModel = model.into();
        active.enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        entities::ProviderGroups::update(active)
            .filter(entities::provider_groups::Column::GroupId.eq(group_id.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_proxy_key(&self, input: &NewProxyKey) -> StorageResult<ProxyKey> {
        use entities::proxy_keys::ActiveModel as ProxyKeyActive;

        let now = OffsetDateTime::now_utc();
        let active = ProxyKeyActive {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(input.name.clone()),
            description: ActiveValue::Set(input.description.clone()),
            key: ActiveValue::Set(input.key.clone()),
            allowed_groups: ActiveValue::Set(serde_json::to_value(&input.allowed_groups)?),
            group_selection_config: ActiveValue::Set(
                input
                    .group_selection_config
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            ),
            is_active: ActiveValue::Set(input.is_active),
            usage_count: ActiveValue::Set(0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            last_used_at: ActiveValue::Set(None),
        };
        let inserted = entities::ProxyKeys::insert(active).exec(&self.db).await?;
        let model = entities::ProxyKeys::find_by_id(inserted.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or(StorageError::NotFound)?;
        proxy_key_model_to_domain(model)
    }

    async fn get_proxy_key_by_secret(&self, secret: &str) -> StorageResult<Option<ProxyKey>> {
        let model = entities::ProxyKeys::find()
            .filter(entities::proxy_keys::Column::Key.eq(secret))
            .one(&self.db)
            .await?;
        model.map(proxy_key_model_to_domain).transpose()
    }

    async fn list_proxy_keys(&self) -> StorageResult<Vec<ProxyKey>> {
        let models = entities::ProxyKeys::find().all(&self.db).await?;
        models.into_iter().map(proxy_key_model_to_domain).collect()
    }

    async fn update_proxy_key(&self, id: i64, update: &ProxyKeyUpdate) -> StorageResult<()> {
        let Some(model) = entities::ProxyKeys::find_by_id(id).one(&self.db).await? else {
            return Err(StorageError::NotFound);
        };
        let mut active: entities::proxy_keys::ActiveModel = model.into();
        if let Some(name) = &update.name {
            active.name = ActiveValue::Set(name.clone());
        }
        if let Some(description) = &update.description {
            active.description = ActiveValue::Set(description.clone());
        }
        if let Some(allowed_groups) = &update.allowed_groups {
            active.allowed_groups = ActiveValue::Set(serde_json::to_value(allowed_groups)?);
        }
        if let Some(config) = &update.group_selection_config {
            active.group_selection_config =
                ActiveValue::Set(config.as_ref().map(serde_json::to_value).transpose()?);
        }
        if let Some(is_active) = update.is_active {
            active.is_active = ActiveValue::Set(is_active);
        }
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_proxy_key(&self, id: i64) -> StorageResult<()> {
        entities::ProxyKeys::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    async fn update_proxy_key_last_used(&self, id: i64) -> StorageResult<()> {
        let Some(model) = entities::ProxyKeys::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::proxy_keys::ActiveModel = model.into();
        active.last_used_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn update_proxy_key_usage(&self, id: i64) -> StorageResult<()> {
        use sea_orm::sea_query::Expr;

        entities::ProxyKeys::update_many()
            .col_expr(
                entities::proxy_keys::Column::UsageCount,
                Expr::col(entities::proxy_keys::Column::UsageCount).add(1),
            )
            .filter(entities::proxy_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_request_log(&self, log: &NewRequestLog) -> StorageResult<i64> {
        use entities::request_logs::ActiveModel as LogActive;

        let active = LogActive {
            id: ActiveValue::NotSet,
            proxy_key_name: ActiveValue::Set(log.proxy_key_name.clone()),
            proxy_key_id: ActiveValue::Set(log.proxy_key_id),
            provider_group: ActiveValue::Set(log.provider_group.clone()),
            openrouter_key: ActiveValue::Set(log.openrouter_key.clone()),
            model: ActiveValue::Set(log.model.clone()),
            request_body: ActiveValue::Set(log.request_body.clone()),
            response_body: ActiveValue::Set(log.response_body.clone()),
            status_code: ActiveValue::Set(log.status_code),
            is_stream: ActiveValue::Set(log.is_stream),
            duration: ActiveValue::Set(log.duration),
            tokens_used: ActiveValue::Set(log.tokens_used),
            tokens_estimated: ActiveValue::Set(log.tokens_estimated),
            error: ActiveValue::Set(log.error.clone()),
            client_ip: ActiveValue::Set(log.client_ip.clone()),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            has_tool_calls: ActiveValue::Set(log.has_tool_calls),
            tool_calls_count: ActiveValue::Set(log.tool_calls_count),
            tool_names: ActiveValue::Set(log.tool_names.clone()),
        };
        let inserted = entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn list_request_logs(
        &self,
        filter: RequestLogFilter,
        limit: u64,
        offset: u64,
    ) -> StorageResult<Vec<RequestLog>> {
        use entities::request_logs::Column;

        let mut query = entities::RequestLogs::find();
        let mut cond = Condition::all();
        if let Some(proxy_key_id) = filter.proxy_key_id {
            cond = cond.add(Column::ProxyKeyId.eq(proxy_key_id));
        }
        if let Some(proxy_key_name) = filter.proxy_key_name {
            cond = cond.add(Column::ProxyKeyName.eq(proxy_key_name));
        }
        if let Some(provider_group) = filter.provider_group {
            cond = cond.add(Column::ProviderGroup.eq(provider_group));
        }
        if let Some(model) = filter.model {
            cond = cond.add(Column::Model.eq(model));
        }
        if let Some(status_code) = filter.status_code {
            cond = cond.add(Column::StatusCode.eq(status_code));
        }
        if let Some(from) = filter.from {
            cond = cond.add(Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.to {
            cond = cond.add(Column::CreatedAt.lte(to));
        }
        query = query.filter(cond);

        let rows = query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(request_log_model_to_domain).collect())
    }

    async fn cleanup_logs_older_than(&self, days: u32) -> StorageResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
        let result = entities::RequestLogs::delete_many()
            .filter(entities::request_logs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
