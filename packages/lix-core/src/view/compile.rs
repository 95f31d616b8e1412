use crate::schema::{PropertyDef, PropertyKind, StoredSchema, LIX_FILE_ID, OWN_ENTITY_PLUGIN_KEY};

use super::sql::{Expr, Ident, Insert, InsertSource, Projection, Select, Statement, TriggerEvent};
use super::{ACTIVE_VERSION_TABLE, STATE_ALL_VIEW, STATE_HISTORY_VIEW, TRANSACTION_STATE_TABLE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewVariant {
    Active,
    AllVersions,
    /// Read-only `<key>_history`. `lixcol_depth` ranks one entity's changes reachable
    /// from `lixcol_root_commit_id`, newest first: 0 is the change the root commit sees.
    /// It is not the commit's distance from the root commit.
    History,
}

impl ViewVariant {
    pub fn relation_name(self, schema_key: &str) -> String {
        match self {
            Self::Active => schema_key.to_string(),
            Self::AllVersions => format!("{schema_key}_all"),
            Self::History => format!("{schema_key}_history"),
        }
    }
}

/// Metadata columns shared by the active and all-versions variants, as
/// `(view column, state column)`.
const STATE_COLUMNS: &[(&str, &str)] = &[
    ("lixcol_entity_id", "entity_id"),
    ("lixcol_schema_key", "schema_key"),
    ("lixcol_file_id", "file_id"),
    ("lixcol_plugin_key", "plugin_key"),
    ("lixcol_schema_version", "schema_version"),
    ("lixcol_inherited_from_version_id", "inherited_from_version_id"),
    ("lixcol_created_at", "created_at"),
    ("lixcol_updated_at", "updated_at"),
    ("lixcol_change_id", "change_id"),
    ("lixcol_commit_id", "commit_id"),
    ("lixcol_untracked", "untracked"),
];

const HISTORY_COLUMNS: &[(&str, &str)] = &[
    ("lixcol_entity_id", "entity_id"),
    ("lixcol_schema_key", "schema_key"),
    ("lixcol_file_id", "file_id"),
    ("lixcol_plugin_key", "plugin_key"),
    ("lixcol_schema_version", "schema_version"),
    ("lixcol_created_at", "created_at"),
    ("lixcol_change_id", "change_id"),
    ("lixcol_commit_id", "commit_id"),
    ("lixcol_root_commit_id", "root_commit_id"),
    ("lixcol_depth", "depth"),
];

const BUFFER_COLUMNS: &[&str] = &[
    "entity_id",
    "schema_key",
    "file_id",
    "version_id",
    "plugin_key",
    "snapshot_content",
    "schema_version",
    "untracked",
];

/// Compiled relations for one stored schema.
#[derive(Clone, Debug)]
pub struct EntityViewPlan {
    schema: StoredSchema,
    variants: Vec<ViewVariant>,
}

impl EntityViewPlan {
    pub fn from_schema(schema: &StoredSchema) -> Self {
        let views = schema.entity_views;
        let variants = [
            (views.active, ViewVariant::Active),
            (views.all, ViewVariant::AllVersions),
            (views.history, ViewVariant::History),
        ]
        .into_iter()
        .filter_map(|(enabled, variant)| enabled.then_some(variant))
        .collect();
        Self {
            schema: schema.clone(),
            variants,
        }
    }

    pub fn variants(&self) -> &[ViewVariant] {
        &self.variants
    }

    pub fn view_names(&self) -> Vec<String> {
        self.variants
            .iter()
            .map(|variant| variant.relation_name(&self.schema.key))
            .collect()
    }

    /// Drops first, then views, then their write triggers.
    pub fn statements(&self) -> Vec<Statement> {
        let mut statements: Vec<Statement> = self
            .view_names()
            .into_iter()
            .map(|name| Statement::DropView {
                name: Ident::new(name),
            })
            .collect();
        for variant in &self.variants {
            statements.push(Statement::CreateView {
                name: Ident::new(variant.relation_name(&self.schema.key)),
                select: self.select(*variant),
            });
            if *variant != ViewVariant::History {
                statements.extend(self.triggers(*variant));
            }
        }
        statements
    }

    fn select(&self, variant: ViewVariant) -> Select {
        let mut projection: Vec<Projection> = self
            .schema
            .properties
            .iter()
            .map(|property| Projection::aliased(self.property_expr(property), &property.name))
            .collect();

        let (source, metadata) = match variant {
            ViewVariant::History => (STATE_HISTORY_VIEW, HISTORY_COLUMNS),
            _ => (STATE_ALL_VIEW, STATE_COLUMNS),
        };
        if variant == ViewVariant::AllVersions {
            projection.push(Projection::aliased(
                Expr::column("version_id"),
                "lixcol_version_id",
            ));
        }
        projection.extend(
            metadata
                .iter()
                .map(|(alias, column)| Projection::aliased(Expr::column(*column), *alias)),
        );

        let mut filters = vec![Expr::column("schema_key").equals(Expr::text(&self.schema.key))];
        let overrides = &self.schema.overrides;
        if let Some(file_id) = &overrides.file_id {
            filters.push(Expr::column("file_id").equals(Expr::text(file_id)));
        }
        if let Some(plugin_key) = &overrides.plugin_key {
            filters.push(Expr::column("plugin_key").equals(Expr::text(plugin_key)));
        }
        match (variant, &overrides.version_id) {
            (ViewVariant::History, _) => {}
            (_, Some(version_id)) => {
                filters.push(Expr::column("version_id").equals(Expr::text(version_id)))
            }
            (ViewVariant::Active, None) => {
                filters.push(Expr::column("version_id").equals(active_version()))
            }
            (ViewVariant::AllVersions, None) => {}
        }

        Select {
            projection,
            from: Some(Ident::new(source)),
            filter: Expr::all(filters),
        }
    }

    /// A lone string primary key is the entity id itself and is not re-extracted.
    fn property_expr(&self, property: &PropertyDef) -> Expr {
        if self.schema.primary_key.len() == 1
            && self.schema.primary_key[0] == property.name
            && property.kind == PropertyKind::String
        {
            return Expr::column("entity_id");
        }
        json_path(&property.name)
    }

    fn triggers(&self, variant: ViewVariant) -> Vec<Statement> {
        let view = variant.relation_name(&self.schema.key);
        let trigger = |suffix: &str, event: TriggerEvent, body: Vec<Insert>| {
            Statement::CreateTrigger {
                name: Ident::new(format!("{view}_{suffix}")),
                event,
                view: Ident::new(&view),
                body,
            }
        };
        vec![
            trigger(
                "insert",
                TriggerEvent::Insert,
                vec![self.stage_upsert(variant, Expr::new_col("lixcol_version_id"))],
            ),
            trigger(
                "update",
                TriggerEvent::Update,
                vec![
                    self.stage_key_change(variant),
                    self.stage_upsert(variant, Expr::new_col("lixcol_version_id")),
                ],
            ),
            trigger(
                "delete",
                TriggerEvent::Delete,
                vec![self.stage_delete(variant)],
            ),
        ]
    }

    fn entity_id_from_new(&self) -> Expr {
        let mut parts = self
            .schema
            .primary_key
            .iter()
            .map(|name| Expr::CastText(Box::new(Expr::new_col(name))));
        let first = parts.next().unwrap_or_else(Expr::null);
        parts.fold(first, |acc, part| acc.concat(Expr::text("~")).concat(part))
    }

    fn version_target(&self, variant: ViewVariant, requested: Expr) -> Expr {
        match (&self.schema.overrides.version_id, variant) {
            (Some(version_id), _) => Expr::text(version_id),
            (None, ViewVariant::AllVersions) => {
                Expr::call("COALESCE", vec![requested, active_version()])
            }
            (None, _) => active_version(),
        }
    }

    fn column_target(&self, fixed: Option<&str>, requested: Expr, default: &str) -> Expr {
        match fixed {
            Some(value) => Expr::text(value),
            None => Expr::call("COALESCE", vec![requested, Expr::text(default)]),
        }
    }

    fn content_from_new(&self) -> Expr {
        let mut args = Vec::with_capacity(self.schema.properties.len() * 2);
        for property in &self.schema.properties {
            let value = Expr::new_col(&property.name);
            args.push(Expr::text(&property.name));
            args.push(match property.kind {
                PropertyKind::Boolean => Expr::Case {
                    branches: vec![
                        (Expr::IsNull(Box::new(value.clone())), Expr::null()),
                        (value, Expr::call("json", vec![Expr::text("true")])),
                    ],
                    otherwise: Box::new(Expr::call("json", vec![Expr::text("false")])),
                },
                kind if kind.is_structured() => Expr::call("json", vec![value]),
                _ => value,
            });
        }
        Expr::call("json_object", args)
    }

    fn stage_upsert(&self, variant: ViewVariant, requested_version: Expr) -> Insert {
        let overrides = &self.schema.overrides;
        buffer_insert(vec![
            self.entity_id_from_new(),
            Expr::text(&self.schema.key),
            self.column_target(
                overrides.file_id.as_deref(),
                Expr::new_col("lixcol_file_id"),
                LIX_FILE_ID,
            ),
            self.version_target(variant, requested_version),
            self.column_target(
                overrides.plugin_key.as_deref(),
                Expr::new_col("lixcol_plugin_key"),
                OWN_ENTITY_PLUGIN_KEY,
            ),
            self.content_from_new(),
            Expr::text(&self.schema.version),
            Expr::call("COALESCE", vec![Expr::new_col("lixcol_untracked"), Expr::int(0)]),
        ])
    }

    /// Deletion of the old row, staged only when an update changes the entity id.
    fn stage_key_change(&self, variant: ViewVariant) -> Insert {
        let mut insert = buffer_insert(Vec::new());
        insert.source = InsertSource::Select(Select {
            projection: self
                .delete_values(variant)
                .into_iter()
                .map(|expr| Projection { expr, alias: None })
                .collect(),
            from: None,
            filter: Some(Expr::old_col("lixcol_entity_id").is_not(self.entity_id_from_new())),
        });
        insert
    }

    fn stage_delete(&self, variant: ViewVariant) -> Insert {
        buffer_insert(self.delete_values(variant))
    }

    fn delete_values(&self, variant: ViewVariant) -> Vec<Expr> {
        vec![
            Expr::old_col("lixcol_entity_id"),
            Expr::text(&self.schema.key),
            Expr::old_col("lixcol_file_id"),
            self.version_target(variant, Expr::old_col("lixcol_version_id")),
            Expr::old_col("lixcol_plugin_key"),
            Expr::null(),
            Expr::text(&self.schema.version),
            Expr::old_col("lixcol_untracked"),
        ]
    }
}

fn active_version() -> Expr {
    Expr::Subquery(Box::new(Select {
        projection: vec![Projection {
            expr: Expr::column("version_id"),
            alias: None,
        }],
        from: Some(Ident::new(ACTIVE_VERSION_TABLE)),
        filter: None,
    }))
}

fn json_path(property: &str) -> Expr {
    let escaped = property.replace('"', "\\\"");
    Expr::call(
        "json_extract",
        vec![
            Expr::column("snapshot_content"),
            Expr::text(format!("$.\"{escaped}\"")),
        ],
    )
}

fn buffer_insert(values: Vec<Expr>) -> Insert {
    Insert {
        or_replace: true,
        table: Ident::new(TRANSACTION_STATE_TABLE),
        columns: BUFFER_COLUMNS.iter().map(|c| Ident::new(*c)).collect(),
        source: InsertSource::Values(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(extra: serde_json::Value) -> StoredSchema {
        let mut definition = json!({
            "x-lix-key": "todo",
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["/id"],
            "properties": {
                "id": { "type": "string" },
                "title": { "type": "string" },
                "done": { "type": "boolean" }
            }
        });
        if let (Some(target), Some(extra)) = (definition.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        StoredSchema::from_value(definition).unwrap()
    }

    fn rendered(plan: &EntityViewPlan) -> Vec<String> {
        plan.statements().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn generates_all_variants_by_default() {
        let plan = EntityViewPlan::from_schema(&schema(json!({})));
        assert_eq!(plan.view_names(), vec!["todo", "todo_all", "todo_history"]);
        // 3 drops, 3 views, 3 triggers for each writable variant
        assert_eq!(plan.statements().len(), 3 + 3 + 6);
    }

    #[test]
    fn variant_suppression_skips_views() {
        let plan = EntityViewPlan::from_schema(&schema(json!({"x-lix-entity-views": ["state"]})));
        assert_eq!(plan.view_names(), vec!["todo"]);
        assert!(rendered(&plan).iter().all(|sql| !sql.contains("todo_all")));
    }

    #[test]
    fn active_view_filters_by_active_version() {
        let plan = EntityViewPlan::from_schema(&schema(json!({})));
        let sql = plan.select(ViewVariant::Active).to_string();
        assert!(sql.contains("\"entity_id\" AS \"id\""));
        assert!(sql.contains("json_extract(\"snapshot_content\", '$.\"title\"') AS \"title\""));
        assert!(sql.contains(
            "(\"version_id\" = (SELECT \"version_id\" FROM \"internal_active_version\"))"
        ));
        assert!(!sql.contains("lixcol_version_id"));
    }

    #[test]
    fn overrides_are_literal_filters_and_values() {
        let plan = EntityViewPlan::from_schema(&schema(json!({
            "x-lix-override-lixcols": {
                "lixcol_file_id": "\"lix\"",
                "lixcol_version_id": "\"global\""
            }
        })));
        let all = plan.select(ViewVariant::AllVersions).to_string();
        assert!(all.contains("(\"file_id\" = 'lix')"));
        assert!(all.contains("(\"version_id\" = 'global')"));

        let insert = plan.stage_upsert(ViewVariant::Active, Expr::new_col("lixcol_version_id"));
        let sql = insert.to_string();
        assert!(sql.contains("'lix', 'global'"), "{sql}");
        assert!(!sql.contains("internal_active_version"));
    }

    #[test]
    fn booleans_are_written_as_json() {
        let plan = EntityViewPlan::from_schema(&schema(json!({})));
        let content = plan.content_from_new().to_string();
        assert!(content.contains(
            "'done', CASE WHEN (NEW.\"done\" IS NULL) THEN NULL WHEN NEW.\"done\" THEN json('true') ELSE json('false') END"
        ));
    }

    #[test]
    fn history_view_is_read_only() {
        let plan = EntityViewPlan::from_schema(&schema(json!({})));
        let sql = rendered(&plan);
        assert!(sql.iter().any(|s| s.contains("FROM \"state_history\"")));
        assert!(sql
            .iter()
            .all(|s| !s.contains("INSTEAD OF INSERT ON \"todo_history\"")));
    }

    #[test]
    fn composite_keys_join_with_tilde() {
        let plan = EntityViewPlan::from_schema(&schema(json!({"x-lix-primary-key": ["/id", "/title"]})));
        assert_eq!(
            plan.entity_id_from_new().to_string(),
            "((CAST(NEW.\"id\" AS TEXT) || '~') || CAST(NEW.\"title\" AS TEXT))"
        );
    }
}
