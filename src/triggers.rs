// ABOUTME: Trigger reconciliation - generates per-table plpgsql capture functions
// ABOUTME: Diffs installed triggers against the desired set; atomic or differential apply

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_postgres::Client;

use crate::config::{PubSubConfig, ReconcileStrategy};
use crate::mapping::TableDescriptor;
use crate::postgres::{quote_ident, quote_literal};
use crate::registry::{Discovery, TableListener};

/// Advisory-lock key gating reconciliation across instances.
pub const RECONCILE_LOCK_KEY: &str = "pg_pubsub";

/// How long the reconcile lock is held.
pub const RECONCILE_LOCK_DURATION: Duration = Duration::from_secs(5);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Trigger functions created or replaced
    pub installed: usize,
    /// Obsolete trigger functions dropped
    pub dropped: usize,
}

/// A `<prefix>_*` trigger currently installed in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledTrigger {
    pub schema: String,
    pub table: String,
    pub name: String,
}

/// Installs and reconciles the per-table capture triggers.
///
/// The contract after [`TriggerService::reconcile`]: the set of functions and
/// triggers named `<prefix>_*` in the trigger schema exactly matches the set
/// derived from discovery, and a row change against any desired table during
/// the reconcile still lands in the queue via either the old or the new
/// function.
pub struct TriggerService {
    client: Arc<Client>,
    trigger_schema: String,
    trigger_prefix: String,
    queue_relation: String,
    channel: String,
    strategy: ReconcileStrategy,
}

impl TriggerService {
    pub fn new(client: Arc<Client>, config: &PubSubConfig) -> Self {
        Self {
            client,
            trigger_schema: config.trigger_schema.clone(),
            trigger_prefix: config.trigger_prefix.clone(),
            queue_relation: config.queue_relation(),
            channel: config.channel().to_string(),
            strategy: config.reconcile_strategy,
        }
    }

    /// Reconcile installed triggers against the discovery result.
    ///
    /// Callers must hold the [`RECONCILE_LOCK_KEY`] advisory lock; this
    /// method does not acquire it itself.
    pub async fn reconcile(&self, discovery: &Discovery) -> Result<ReconcileSummary> {
        let desired = self.desired_set(discovery)?;
        let installed = self.installed_functions().await?;

        let summary = match self.strategy {
            ReconcileStrategy::AtomicReplace => {
                self.reconcile_atomic(&installed, &desired).await?
            }
            ReconcileStrategy::DifferentialUpsert => {
                self.reconcile_differential(&installed, &desired).await?
            }
        };

        tracing::info!(
            "Trigger reconciliation complete: {} installed, {} dropped",
            summary.installed,
            summary.dropped
        );
        Ok(summary)
    }

    /// List `<prefix>_*` trigger function names in the trigger schema.
    pub async fn installed_functions(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT p.proname
                 FROM pg_proc p
                 JOIN pg_namespace n ON n.oid = p.pronamespace
                 WHERE n.nspname = $1 AND p.proname LIKE $2
                 ORDER BY p.proname",
                &[&self.trigger_schema, &like_pattern(&self.trigger_prefix)],
            )
            .await
            .context("Failed to list installed trigger functions")?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// List `<prefix>_*` row triggers with the table they are bound to.
    pub async fn installed_triggers(&self) -> Result<Vec<InstalledTrigger>> {
        let rows = self
            .client
            .query(
                "SELECT n.nspname, c.relname, t.tgname
                 FROM pg_trigger t
                 JOIN pg_class c ON c.oid = t.tgrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE NOT t.tgisinternal
                   AND n.nspname = $1
                   AND t.tgname LIKE $2
                 ORDER BY t.tgname",
                &[&self.trigger_schema, &like_pattern(&self.trigger_prefix)],
            )
            .await
            .context("Failed to list installed triggers")?;
        Ok(rows
            .iter()
            .map(|row| InstalledTrigger {
                schema: row.get(0),
                table: row.get(1),
                name: row.get(2),
            })
            .collect())
    }

    /// Compute the desired trigger set, keyed by function name.
    fn desired_set<'a>(
        &self,
        discovery: &'a Discovery,
    ) -> Result<BTreeMap<String, (&'a TableListener, &'a TableDescriptor)>> {
        let mut desired = BTreeMap::new();
        for listener in discovery.listeners.values() {
            let name = trigger_name(&self.trigger_prefix, &listener.table)?;
            let descriptor = discovery.descriptor(&listener.table).with_context(|| {
                format!("No descriptor for discovered table '{}'", listener.table)
            })?;
            desired.insert(name, (listener, descriptor));
        }
        Ok(desired)
    }

    /// Full replace inside one transaction: zero window with missing
    /// triggers, at the cost of briefly locking every affected table.
    async fn reconcile_atomic(
        &self,
        installed: &[String],
        desired: &BTreeMap<String, (&TableListener, &TableDescriptor)>,
    ) -> Result<ReconcileSummary> {
        let mut script = String::from("BEGIN;\n");
        for name in installed {
            script.push_str(&drop_function_sql(&self.trigger_schema, name));
            script.push('\n');
        }
        for (name, (listener, descriptor)) in desired {
            script.push_str(&create_trigger_script(
                &self.trigger_schema,
                name,
                &self.queue_relation,
                &self.channel,
                listener,
                descriptor,
            ));
            script.push('\n');
        }
        script.push_str("COMMIT;");

        self.client
            .batch_execute(&script)
            .await
            .context("Atomic trigger reconciliation failed")?;

        Ok(ReconcileSummary {
            installed: desired.len(),
            dropped: installed.len(),
        })
    }

    /// Upsert every desired trigger first (per-table transaction), then drop
    /// only the functions whose table is no longer desired. Tables that stay
    /// registered across the reconfiguration never lose capture coverage; an
    /// obsolete trigger may overlap briefly, which is harmless because only
    /// desired tables route to handlers.
    async fn reconcile_differential(
        &self,
        installed: &[String],
        desired: &BTreeMap<String, (&TableListener, &TableDescriptor)>,
    ) -> Result<ReconcileSummary> {
        for (name, (listener, descriptor)) in desired {
            let script = format!(
                "BEGIN;\n{}\nCOMMIT;",
                create_trigger_script(
                    &self.trigger_schema,
                    name,
                    &self.queue_relation,
                    &self.channel,
                    listener,
                    descriptor,
                )
            );
            self.client.batch_execute(&script).await.with_context(|| {
                format!(
                    "Failed to install trigger '{}' on {}.{}",
                    name, listener.schema, listener.table
                )
            })?;
        }

        let obsolete = obsolete_functions(installed, desired);
        for name in &obsolete {
            self.client
                .batch_execute(&drop_function_sql(&self.trigger_schema, name))
                .await
                .with_context(|| format!("Failed to drop obsolete trigger function '{}'", name))?;
            tracing::debug!("Dropped obsolete trigger function '{}'", name);
        }

        Ok(ReconcileSummary {
            installed: desired.len(),
            dropped: obsolete.len(),
        })
    }
}

/// Build `<prefix>_<table>`, rejecting names the server would silently
/// truncate into collisions.
pub fn trigger_name(prefix: &str, table: &str) -> Result<String> {
    let name = format!("{}_{}", prefix, table);
    if name.len() > 63 {
        bail!(
            "Trigger name '{}' exceeds PostgreSQL's 63-character identifier limit; \
             shorten the trigger prefix or the table name",
            name
        );
    }
    Ok(name)
}

/// LIKE pattern matching `<prefix>_*` with wildcard characters escaped.
fn like_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 3);
    for ch in prefix.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("\\_%");
    escaped
}

/// `DROP FUNCTION ... CASCADE` removes the bound row trigger as well.
fn drop_function_sql(schema: &str, function: &str) -> String {
    format!(
        "DROP FUNCTION IF EXISTS {}.{}() CASCADE;",
        quote_ident(schema),
        quote_ident(function)
    )
}

/// Function + trigger DDL for one table.
fn create_trigger_script(
    schema: &str,
    name: &str,
    queue_relation: &str,
    channel: &str,
    listener: &TableListener,
    descriptor: &TableDescriptor,
) -> String {
    let function = quote_ident(name);
    let table = format!(
        "{}.{}",
        quote_ident(&listener.schema),
        quote_ident(&listener.table)
    );
    let events: Vec<&str> = listener.events.events().iter().map(|e| e.as_sql()).collect();

    format!(
        "{func_sql};\nDROP TRIGGER IF EXISTS {function} ON {table};\n\
         CREATE TRIGGER {function}\nAFTER {events} ON {table}\n\
         FOR EACH ROW EXECUTE FUNCTION {schema}.{function}();",
        func_sql = trigger_function_sql(schema, name, queue_relation, channel, listener, descriptor),
        function = function,
        table = table,
        events = events.join(" OR "),
        schema = quote_ident(schema),
    )
}

/// The generated plpgsql capture function.
///
/// For each firing the function builds the wire payload, inserts one queue
/// row, and notifies the channel with the new row id as text. The
/// `updatedFields` diff for UPDATE events is deliberately not computed here;
/// the processor derives it after property remapping.
fn trigger_function_sql(
    schema: &str,
    name: &str,
    queue_relation: &str,
    channel: &str,
    listener: &TableListener,
    descriptor: &TableDescriptor,
) -> String {
    let new_expr = row_expression("NEW", listener, descriptor);
    let old_expr = row_expression("OLD", listener, descriptor);
    let channel = quote_literal(channel);

    format!(
        "CREATE OR REPLACE FUNCTION {schema}.{function}() RETURNS trigger AS $pubsub$
DECLARE
    payload jsonb;
    queued_id bigint;
BEGIN
    IF TG_OP = 'INSERT' THEN
        payload := jsonb_build_object(
            'id', gen_random_uuid(),
            'event', TG_OP,
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'data', {new_expr});
    ELSIF TG_OP = 'UPDATE' THEN
        payload := jsonb_build_object(
            'id', gen_random_uuid(),
            'event', TG_OP,
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'data', jsonb_build_object('new', {new_expr}, 'old', {old_expr}));
    ELSE
        payload := jsonb_build_object(
            'id', gen_random_uuid(),
            'event', TG_OP,
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'data', {old_expr});
    END IF;

    INSERT INTO {queue} (channel, payload)
    VALUES ({channel}, payload)
    RETURNING id INTO queued_id;

    PERFORM pg_notify({channel}, queued_id::text);
    RETURN NULL;
END;
$pubsub$ LANGUAGE plpgsql",
        schema = quote_ident(schema),
        function = quote_ident(name),
        new_expr = new_expr,
        old_expr = old_expr,
        queue = queue_relation,
        channel = channel,
    )
}

/// The JSON expression capturing one side of the row: the whole record, or
/// an object restricted to the mapped payload columns.
fn row_expression(record: &str, listener: &TableListener, descriptor: &TableDescriptor) -> String {
    match &listener.payload_fields {
        None => format!("to_jsonb({record})"),
        Some(properties) => {
            let columns = descriptor.columns_for_properties(properties);
            if columns.is_empty() {
                return format!("to_jsonb({record})");
            }
            let pairs: Vec<String> = columns
                .iter()
                .map(|column| {
                    format!("{}, {}.{}", quote_literal(column), record, quote_ident(column))
                })
                .collect();
            format!("jsonb_build_object({})", pairs.join(", "))
        }
    }
}

/// Installed function names with no counterpart in the desired set.
fn obsolete_functions(
    installed: &[String],
    desired: &BTreeMap<String, (&TableListener, &TableDescriptor)>,
) -> Vec<String> {
    installed
        .iter()
        .filter(|name| !desired.contains_key(*name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, TableChanges};
    use crate::registry::{merge_registrations, ChangeHandler, FailureSink, HandlerRegistration};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullHandler;

    #[async_trait]
    impl ChangeHandler for NullHandler {
        async fn process(&self, _: &TableChanges, _: &FailureSink) -> Result<()> {
            Ok(())
        }
    }

    fn listener(
        table: &str,
        events: Option<&[EventKind]>,
        fields: Option<&[&str]>,
    ) -> TableListener {
        let mut registration = HandlerRegistration::new(table, Arc::new(NullHandler));
        if let Some(events) = events {
            registration = registration.events(events);
        }
        if let Some(fields) = fields {
            registration = registration.payload_fields(fields);
        }
        merge_registrations("public", &[registration])
            .unwrap()
            .remove(table)
            .unwrap()
    }

    fn users_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            "public",
            "users",
            vec!["id".into(), "full_name".into(), "email".into()],
            &[],
        )
    }

    const QUEUE: &str = "\"public\".\"pg_pubsub_queue\"";

    #[test]
    fn test_trigger_name_limit() {
        assert_eq!(
            trigger_name("pubsub_trigger", "users").unwrap(),
            "pubsub_trigger_users"
        );
        let long_table = "t".repeat(60);
        assert!(trigger_name("pubsub_trigger", &long_table).is_err());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("pubsub_trigger"), "pubsub\\_trigger\\_%");
        assert_eq!(like_pattern("p%x"), "p\\%x\\_%");
    }

    #[test]
    fn test_row_expression_full_row() {
        let listener = listener("users", None, None);
        assert_eq!(
            row_expression("NEW", &listener, &users_descriptor()),
            "to_jsonb(NEW)"
        );
    }

    #[test]
    fn test_row_expression_projected() {
        let listener = listener("users", None, Some(&["fullName", "id"]));
        let expr = row_expression("NEW", &listener, &users_descriptor());
        assert!(expr.starts_with("jsonb_build_object("));
        assert!(expr.contains("'full_name', NEW.\"full_name\""));
        assert!(expr.contains("'id', NEW.\"id\""));
        assert!(!expr.contains("email"));
    }

    #[test]
    fn test_function_sql_inserts_and_notifies() {
        let listener = listener("users", None, None);
        let sql = trigger_function_sql(
            "public",
            "pubsub_trigger_users",
            QUEUE,
            "pubsub_trigger",
            &listener,
            &users_descriptor(),
        );
        assert!(sql.contains("CREATE OR REPLACE FUNCTION \"public\".\"pubsub_trigger_users\"()"));
        assert!(sql.contains("INSERT INTO \"public\".\"pg_pubsub_queue\" (channel, payload)"));
        assert!(sql.contains("PERFORM pg_notify('pubsub_trigger', queued_id::text)"));
        assert!(sql.contains("'id', gen_random_uuid()"));
        assert!(sql.contains("jsonb_build_object('new', to_jsonb(NEW), 'old', to_jsonb(OLD))"));
        assert!(sql.contains("LANGUAGE plpgsql"));
    }

    #[test]
    fn test_trigger_script_honors_event_mask() {
        let listener = listener("users", Some(&[EventKind::Insert, EventKind::Delete]), None);
        let script = create_trigger_script(
            "public",
            "pubsub_trigger_users",
            QUEUE,
            "pubsub_trigger",
            &listener,
            &users_descriptor(),
        );
        assert!(script.contains("AFTER INSERT OR DELETE ON \"public\".\"users\""));
        assert!(!script.contains("AFTER INSERT OR UPDATE"));
        assert!(script.contains("DROP TRIGGER IF EXISTS \"pubsub_trigger_users\""));
        assert!(script.contains("FOR EACH ROW EXECUTE FUNCTION \"public\".\"pubsub_trigger_users\"()"));
    }

    #[test]
    fn test_trigger_script_full_mask() {
        let listener = listener("users", None, None);
        let script = create_trigger_script(
            "public",
            "pubsub_trigger_users",
            QUEUE,
            "pubsub_trigger",
            &listener,
            &users_descriptor(),
        );
        assert!(script.contains("AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"users\""));
    }

    #[test]
    fn test_obsolete_functions_diff() {
        let desired: BTreeMap<String, (&TableListener, &TableDescriptor)> = BTreeMap::new();
        let installed = vec!["pubsub_trigger_old".to_string()];
        assert_eq!(obsolete_functions(&installed, &desired), installed);
    }

    #[test]
    fn test_drop_function_sql_cascades() {
        assert_eq!(
            drop_function_sql("public", "pubsub_trigger_old"),
            "DROP FUNCTION IF EXISTS \"public\".\"pubsub_trigger_old\"() CASCADE;"
        );
    }
}
