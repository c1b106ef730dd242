use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{BackuparrError, Result};

/// Postgres connection details, either parsed from a backup's config.xml or
/// supplied as an operator override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub main_db: String,
    pub log_db: String,
}

/// `SET` parameters that only exist on newer Postgres versions and break
/// restores onto older servers. Data, not logic: extend the list, don't
/// branch on versions.
pub const INCOMPATIBLE_SET_PARAMETERS: &[&str] = &["transaction_timeout"];

/// Drops every table, sequence, and view in the public schema so a dump can
/// be replayed onto a non-empty database.
const DROP_PUBLIC_OBJECTS_SQL: &str = r#"
DO $$ DECLARE
    r RECORD;
BEGIN
    FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = 'public') LOOP
        EXECUTE 'DROP TABLE IF EXISTS "' || r.tablename || '" CASCADE';
    END LOOP;
    FOR r IN (SELECT sequencename FROM pg_sequences WHERE schemaname = 'public') LOOP
        EXECUTE 'DROP SEQUENCE IF EXISTS "' || r.sequencename || '" CASCADE';
    END LOOP;
    FOR r IN (SELECT viewname FROM pg_views WHERE schemaname = 'public') LOOP
        EXECUTE 'DROP VIEW IF EXISTS "' || r.viewname || '" CASCADE';
    END LOOP;
END $$;
"#;

impl PostgresConfig {
    /// Apply an operator override: non-empty override fields win.
    pub fn with_override(mut self, overrides: Option<&PostgresConfig>) -> Self {
        let Some(o) = overrides else { return self };
        apply_if_set(&mut self.host, &o.host);
        apply_if_set(&mut self.port, &o.port);
        apply_if_set(&mut self.user, &o.user);
        apply_if_set(&mut self.password, &o.password);
        apply_if_set(&mut self.main_db, &o.main_db);
        apply_if_set(&mut self.log_db, &o.log_db);
        self
    }

    fn connection_args(&self, db_name: &str) -> Vec<String> {
        vec![
            "-h".into(),
            self.host.clone(),
            "-p".into(),
            self.port.clone(),
            "-U".into(),
            self.user.clone(),
            "-d".into(),
            db_name.into(),
            "--no-password".into(),
        ]
    }

    /// Run `pg_dump` and return the plain-SQL dump.
    pub fn dump_database(&self, db_name: &str) -> Result<Vec<u8>> {
        if db_name.is_empty() {
            return Err(BackuparrError::Config("database name is empty".into()));
        }

        let mut args = self.connection_args(db_name);
        args.extend(["--format=plain".into(), "--no-owner".into(), "--no-acl".into()]);

        let output = Command::new("pg_dump")
            .args(&args)
            .env("PGPASSWORD", &self.password)
            .output()
            .map_err(|e| BackuparrError::Config(format!("cannot invoke pg_dump: {e}")))?;

        if !output.status.success() {
            return Err(BackuparrError::Backend(format!(
                "pg_dump of '{db_name}' failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }

    /// Dump the main and log databases, keyed by sanitized dump filename.
    pub fn dump_all(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut dumps = BTreeMap::new();
        for db in [&self.main_db, &self.log_db] {
            if db.is_empty() {
                continue;
            }
            let dump = self.dump_database(db)?;
            dumps.insert(sanitize_dump_name(db), dump);
        }
        Ok(dumps)
    }

    /// Replay a SQL dump onto a database: drop all public-schema objects,
    /// then pipe the (filtered) dump into psql with `ON_ERROR_STOP=1`.
    pub fn restore_database(&self, db_name: &str, dump: &[u8]) -> Result<()> {
        if db_name.is_empty() {
            return Err(BackuparrError::Config("database name is empty".into()));
        }

        let base_args = self.connection_args(db_name);

        let drop_output = Command::new("psql")
            .args(&base_args)
            .args(["-c", DROP_PUBLIC_OBJECTS_SQL])
            .env("PGPASSWORD", &self.password)
            .output()
            .map_err(|e| BackuparrError::Config(format!("cannot invoke psql: {e}")))?;
        if !drop_output.status.success() {
            return Err(BackuparrError::Restore(format!(
                "dropping existing objects in '{db_name}' failed: {}",
                String::from_utf8_lossy(&drop_output.stderr)
            )));
        }

        let filtered = filter_incompatible_statements(dump);

        let mut child = Command::new("psql")
            .args(&base_args)
            .args(["-v", "ON_ERROR_STOP=1"])
            .env("PGPASSWORD", &self.password)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackuparrError::Config(format!("cannot invoke psql: {e}")))?;

        if let Some(stdin) = child.stdin.take() {
            let mut stdin = stdin;
            stdin.write_all(&filtered)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(BackuparrError::Restore(format!(
                "psql restore of '{db_name}' failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Restore every dump in the map, resolving filenames back to database
    /// names via the sanitization rule.
    pub fn restore_all(&self, dumps: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut known = BTreeMap::new();
        for db in [&self.main_db, &self.log_db] {
            if !db.is_empty() {
                known.insert(sanitize_dump_name(db), db.clone());
            }
        }

        for (filename, dump) in dumps {
            let db_name = match known.get(filename) {
                Some(db) => db.clone(),
                // Unrecognized dump: undo the sanitization on the stem.
                None => filename.trim_end_matches(".sql").replace('_', "-"),
            };
            tracing::info!(
                "restoring database '{db_name}' from {filename} ({} bytes)",
                dump.len()
            );
            self.restore_database(&db_name, dump)?;
        }
        Ok(())
    }
}

fn apply_if_set(field: &mut String, value: &str) {
    if !value.is_empty() {
        *field = value.to_string();
    }
}

/// Dump filename for a database: `-` becomes `_`, `.sql` appended.
pub fn sanitize_dump_name(db_name: &str) -> String {
    format!("{}.sql", db_name.replace('-', "_"))
}

/// Remove `SET` statements that reference version-specific parameters
/// unknown to older Postgres servers.
pub fn filter_incompatible_statements(dump: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(dump);
    let filtered: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if !trimmed.to_uppercase().starts_with("SET ") {
                return true;
            }
            let lowered = trimmed.to_lowercase();
            !INCOMPATIBLE_SET_PARAMETERS
                .iter()
                .any(|p| lowered.contains(p))
        })
        .collect();
    filtered.join("\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_dashes() {
        assert_eq!(sanitize_dump_name("sonarr-main"), "sonarr_main.sql");
        assert_eq!(sanitize_dump_name("radarr_log"), "radarr_log.sql");
    }

    #[test]
    fn filter_removes_incompatible_set_lines() {
        let dump = b"SET statement_timeout = 0;\nSET transaction_timeout = 0;\nCREATE TABLE t (id int);\n  set Transaction_Timeout = 5;\n";
        let filtered = String::from_utf8(filter_incompatible_statements(dump)).unwrap();
        assert!(!filtered.to_lowercase().contains("transaction_timeout"));
        assert!(filtered.contains("SET statement_timeout = 0;"));
        assert!(filtered.contains("CREATE TABLE t (id int);"));
    }

    #[test]
    fn filter_keeps_non_set_mentions() {
        // Only SET statements are filtered; data lines mentioning the
        // parameter name survive.
        let dump = b"INSERT INTO log VALUES ('transaction_timeout tweak');\n";
        let filtered = String::from_utf8(filter_incompatible_statements(dump)).unwrap();
        assert!(filtered.contains("transaction_timeout tweak"));
    }

    #[test]
    fn override_wins_per_field() {
        let detected = PostgresConfig {
            host: "db.internal".into(),
            port: "5432".into(),
            user: "sonarr".into(),
            password: "secret".into(),
            main_db: "sonarr-main".into(),
            log_db: "sonarr-log".into(),
        };
        let overrides = PostgresConfig {
            host: "db.external".into(),
            password: "override".into(),
            ..Default::default()
        };
        let merged = detected.with_override(Some(&overrides));
        assert_eq!(merged.host, "db.external");
        assert_eq!(merged.password, "override");
        assert_eq!(merged.port, "5432");
        assert_eq!(merged.main_db, "sonarr-main");
    }

    #[test]
    fn no_override_is_identity() {
        let detected = PostgresConfig {
            host: "db".into(),
            ..Default::default()
        };
        assert_eq!(detected.clone().with_override(None), detected);
    }

    #[test]
    fn restore_all_maps_unknown_filenames() {
        // The name mapping itself; no psql is invoked because the map is empty.
        let cfg = PostgresConfig::default();
        assert!(cfg.restore_all(&BTreeMap::new()).is_ok());
    }
}
