//! Warehouse command text. Identifiers are validated at config load; values go through
//! [`quote_literal`].

use crate::domain::model::{
    Category, CopyOptions, RunLease, StageFormat, TargetTable, WAREHOUSE_TIMESTAMP_FORMAT,
};
use serde::{Deserialize, Serialize};

/// How the warehouse authenticates against the object store during COPY.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyCredentials {
    IamRole {
        iam_role: String,
    },
    AccessKeys {
        access_key_id: String,
        secret_access_key: String,
    },
}

impl std::fmt::Debug for CopyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl CopyCredentials {
    fn clause(&self) -> String {
        match self {
            CopyCredentials::IamRole { iam_role } => format!("IAM_ROLE {}", quote_literal(iam_role)),
            CopyCredentials::AccessKeys {
                access_key_id,
                secret_access_key,
            } => format!(
                "CREDENTIALS {}",
                quote_literal(&format!(
                    "aws_access_key_id={};aws_secret_access_key={}",
                    access_key_id, secret_access_key
                ))
            ),
        }
    }

    /// 給 log / dry-run 用，不含密鑰
    pub fn redacted(&self) -> String {
        match self {
            CopyCredentials::IamRole { iam_role } => format!("IAM_ROLE '{}'", iam_role),
            CopyCredentials::AccessKeys { .. } => {
                "CREDENTIALS 'aws_access_key_id=***;aws_secret_access_key=***'".to_string()
            }
        }
    }
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// WHERE condition selecting one category's rows.
pub fn category_predicate(target: &TargetTable, category: &Category) -> Option<String> {
    let column = target.category_column.as_deref()?;
    match category {
        Category::All => None,
        Category::Uncategorised => Some(format!("LENGTH({}) = 0", column)),
        Category::Named(name) => Some(format!("{} = {}", column, quote_literal(name))),
    }
}

pub fn max_timestamp(target: &TargetTable, category: &Category) -> String {
    let mut sql = format!(
        "SELECT MAX({}) FROM {}",
        target.timestamp_column, target.table
    );
    if let Some(predicate) = category_predicate(target, category) {
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    sql
}

pub fn delete_all(table: &str) -> String {
    format!("DELETE FROM {}", table)
}

pub fn vacuum(table: &str) -> String {
    format!("VACUUM {}", table)
}

pub fn analyze(table: &str) -> String {
    format!("ANALYZE {}", table)
}

fn copy_with(table: &str, uri: &str, options: &CopyOptions, credentials: &str) -> String {
    let mut sql = format!(
        "COPY {} FROM {} {}",
        table,
        quote_literal(uri),
        credentials
    );
    match options.format {
        StageFormat::Csv => sql.push_str(" CSV DELIMITER ','"),
        StageFormat::Json => {
            let paths = options.json_paths_uri.as_deref().unwrap_or("auto");
            sql.push_str(&format!(" JSON {}", quote_literal(paths)));
        }
    }
    if options.accept_invalid_chars {
        sql.push_str(" ACCEPTINVCHARS");
    }
    sql
}

pub fn copy(table: &str, uri: &str, options: &CopyOptions, credentials: &CopyCredentials) -> String {
    copy_with(table, uri, options, &credentials.clause())
}

pub fn copy_redacted(
    table: &str,
    uri: &str,
    options: &CopyOptions,
    credentials: &CopyCredentials,
) -> String {
    copy_with(table, uri, options, &credentials.redacted())
}

/// Statements of the duplicate pass, meant to run in one transaction.
///
/// 1. uncategorised rows whose key also exists on a categorised row are removed;
/// 2. among uncategorised rows sharing a key only the latest ETL timestamp stays;
/// 3. what is left duplicated is identical and gets collapsed through a temp table.
///
/// Without a category column every row counts as uncategorised and step 1 is skipped.
/// Returns `None` when the target has no key column.
pub fn dedup_statements(target: &TargetTable) -> Option<DedupStatements> {
    let key = target.key_column.as_deref()?;
    let category = target.category_column.as_deref();
    let table = target.table.as_str();
    let etl = target.etl_timestamp_column.as_str();
    let scratch = format!("{}_dedup", table.replace('.', "_"));

    let (where_uncategorised, and_uncategorised, and_qualified) = match category {
        Some(category) => (
            format!(" WHERE LENGTH({category}) = 0"),
            format!(" AND LENGTH({category}) = 0"),
            format!(" AND LENGTH({table}.{category}) = 0"),
        ),
        None => (String::new(), String::new(), String::new()),
    };
    let duplicated_keys = format!(
        "SELECT {key} FROM {table}{where_uncategorised} GROUP BY {key} HAVING COUNT(*) > 1"
    );

    Some(DedupStatements {
        drop_shadowed: category.map(|category| {
            format!(
                "DELETE FROM {table} WHERE LENGTH({category}) = 0 AND {key} IN \
                 (SELECT {key} FROM {table} WHERE LENGTH({category}) > 0)"
            )
        }),
        drop_stale: format!(
            "DELETE FROM {table} USING \
             (SELECT {key}, MAX({etl}) AS keep_tstamp FROM {table}{where_uncategorised} \
             GROUP BY {key} HAVING COUNT(*) > 1) AS latest \
             WHERE {table}.{key} = latest.{key}{and_qualified} \
             AND {table}.{etl} < latest.keep_tstamp"
        ),
        collect_copies: format!(
            "CREATE TEMP TABLE {scratch} AS SELECT DISTINCT * FROM {table} \
             WHERE {key} IN ({duplicated_keys}){and_uncategorised}"
        ),
        drop_copies: format!(
            "DELETE FROM {table} WHERE {key} IN (SELECT {key} FROM {scratch}){and_uncategorised}"
        ),
        restore_single: format!("INSERT INTO {table} SELECT * FROM {scratch}"),
        drop_scratch: format!("DROP TABLE {scratch}"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupStatements {
    /// Only for targets with a category column.
    pub drop_shadowed: Option<String>,
    pub drop_stale: String,
    pub collect_copies: String,
    pub drop_copies: String,
    pub restore_single: String,
    pub drop_scratch: String,
}

pub fn create_lock_table(lock_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (pipeline VARCHAR(256) NOT NULL, holder VARCHAR(256) NOT NULL, \
         acquired_at TIMESTAMP NOT NULL, expires_at TIMESTAMP NOT NULL)",
        lock_table
    )
}

pub fn expire_leases(lock_table: &str, lease: &RunLease) -> String {
    format!(
        "DELETE FROM {} WHERE pipeline = {} AND expires_at <= {}",
        lock_table,
        quote_literal(&lease.pipeline),
        quote_literal(&lease.acquired_at.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string())
    )
}

pub fn insert_lease(lock_table: &str, lease: &RunLease) -> String {
    format!(
        "INSERT INTO {table} (pipeline, holder, acquired_at, expires_at) SELECT {p}, {h}, {a}, {e} \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE pipeline = {p})",
        table = lock_table,
        p = quote_literal(&lease.pipeline),
        h = quote_literal(&lease.holder),
        a = quote_literal(&lease.acquired_at.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()),
        e = quote_literal(&lease.expires_at.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()),
    )
}

pub fn select_lease(lock_table: &str, pipeline: &str) -> String {
    format!(
        "SELECT holder, acquired_at, expires_at FROM {} WHERE pipeline = {}",
        lock_table,
        quote_literal(pipeline)
    )
}

pub fn release_lease(lock_table: &str, lease: &RunLease) -> String {
    format!(
        "DELETE FROM {} WHERE pipeline = {} AND holder = {}",
        lock_table,
        quote_literal(&lease.pipeline),
        quote_literal(&lease.holder)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::WatermarkGranularity;
    use chrono::NaiveDate;

    fn tickets() -> TargetTable {
        TargetTable {
            table: "zendesk.tickets".to_string(),
            timestamp_column: "created_at".to_string(),
            watermark_granularity: WatermarkGranularity::Second,
            category_column: Some("ticket_form".to_string()),
            key_column: Some("id".to_string()),
            etl_timestamp_column: "etl_tstamp".to_string(),
        }
    }

    fn keys() -> CopyCredentials {
        CopyCredentials::AccessKeys {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "s3cr3t".to_string(),
        }
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_max_timestamp_per_category() {
        let target = tickets();
        assert_eq!(
            max_timestamp(&target, &Category::Uncategorised),
            "SELECT MAX(created_at) FROM zendesk.tickets WHERE LENGTH(ticket_form) = 0"
        );
        assert_eq!(
            max_timestamp(&target, &Category::Named("Technical enquiry".to_string())),
            "SELECT MAX(created_at) FROM zendesk.tickets WHERE ticket_form = 'Technical enquiry'"
        );
        assert_eq!(
            max_timestamp(&target, &Category::All),
            "SELECT MAX(created_at) FROM zendesk.tickets"
        );
    }

    #[test]
    fn test_copy_json_with_paths_file() {
        let options = CopyOptions {
            format: StageFormat::Json,
            json_paths_uri: Some("s3://json-repository/zendesk_data_json_paths.json".to_string()),
            accept_invalid_chars: true,
        };
        let sql = copy(
            "zendesk.tickets",
            "s3://json-repository/2020_03_01_zendesk_tickets.json",
            &options,
            &keys(),
        );
        assert_eq!(
            sql,
            "COPY zendesk.tickets FROM 's3://json-repository/2020_03_01_zendesk_tickets.json' \
             CREDENTIALS 'aws_access_key_id=AKIA;aws_secret_access_key=s3cr3t' \
             JSON 's3://json-repository/zendesk_data_json_paths.json' ACCEPTINVCHARS"
        );
    }

    #[test]
    fn test_copy_csv_with_iam_role() {
        let options = CopyOptions {
            format: StageFormat::Csv,
            json_paths_uri: None,
            accept_invalid_chars: false,
        };
        let role = CopyCredentials::IamRole {
            iam_role: "arn:aws:iam::123:role/copy".to_string(),
        };
        assert_eq!(
            copy("pipedrive.leads", "s3://csv-repository/x.csv", &options, &role),
            "COPY pipedrive.leads FROM 's3://csv-repository/x.csv' \
             IAM_ROLE 'arn:aws:iam::123:role/copy' CSV DELIMITER ','"
        );
    }

    #[test]
    fn test_redacted_copy_hides_secrets() {
        let options = CopyOptions {
            format: StageFormat::Json,
            json_paths_uri: None,
            accept_invalid_chars: false,
        };
        let sql = copy_redacted("t", "s3://b/k", &options, &keys());
        assert!(!sql.contains("s3cr3t"));
        assert!(sql.ends_with("JSON 'auto'"));
        assert!(!format!("{:?}", keys()).contains("s3cr3t"));
    }

    #[test]
    fn test_dedup_statements_only_touch_uncategorised_rows() {
        let statements = dedup_statements(&tickets()).unwrap();
        let drop_shadowed = statements.drop_shadowed.clone().unwrap();
        for sql in [
            &drop_shadowed,
            &statements.drop_stale,
            &statements.drop_copies,
        ] {
            assert!(sql.starts_with("DELETE FROM zendesk.tickets"));
            assert!(sql.contains("LENGTH(") && sql.contains(") = 0"));
        }
        assert!(statements.collect_copies.contains("zendesk_tickets_dedup"));
        assert!(statements.drop_stale.contains("zendesk.tickets.etl_tstamp < latest.keep_tstamp"));
        assert_eq!(statements.drop_scratch, "DROP TABLE zendesk_tickets_dedup");
    }

    #[test]
    fn test_dedup_without_category_covers_every_row() {
        let mut target = tickets();
        target.category_column = None;
        target.key_column = Some("LineItemID".to_string());

        let statements = dedup_statements(&target).unwrap();
        assert_eq!(statements.drop_shadowed, None);
        assert!(!statements.drop_stale.contains("LENGTH("));
        assert!(statements
            .drop_stale
            .contains("WHERE zendesk.tickets.LineItemID = latest.LineItemID AND"));
        assert_eq!(
            statements.drop_copies,
            "DELETE FROM zendesk.tickets WHERE LineItemID IN (SELECT LineItemID FROM zendesk_tickets_dedup)"
        );
    }

    #[test]
    fn test_dedup_requires_key() {
        let mut target = tickets();
        target.key_column = None;
        assert!(dedup_statements(&target).is_none());
    }

    #[test]
    fn test_lease_statements() {
        let at = NaiveDate::from_ymd_opt(2020, 3, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        let lease = RunLease {
            pipeline: "zendesk_tickets".to_string(),
            holder: "host-42".to_string(),
            acquired_at: at,
            expires_at: at + chrono::Duration::hours(2),
        };
        let insert = insert_lease("etl.run_locks", &lease);
        assert!(insert.contains("'2020-03-01 08:00:00'"));
        assert!(insert.contains("WHERE NOT EXISTS (SELECT 1 FROM etl.run_locks WHERE pipeline = 'zendesk_tickets')"));
        assert_eq!(
            expire_leases("etl.run_locks", &lease),
            "DELETE FROM etl.run_locks WHERE pipeline = 'zendesk_tickets' AND expires_at <= '2020-03-01 06:00:00'"
        );
        assert_eq!(
            release_lease("etl.run_locks", &lease),
            "DELETE FROM etl.run_locks WHERE pipeline = 'zendesk_tickets' AND holder = 'host-42'"
        );
    }
}
