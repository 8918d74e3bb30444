use sqlx::{Connection, PgConnection};
use tracing::info;
use url::Url;

use crate::errors::Result;

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Admin URL on the same server, pointed at the `postgres` maintenance database.
fn admin_url(instance_ref: &str) -> Result<String> {
    let mut url = Url::parse(instance_ref)?;
    url.set_path("/postgres");
    Ok(url.to_string())
}

fn create_database_sql(db_name: &str, owner: &str) -> String {
    let mut sql = format!("CREATE DATABASE {}", quote_identifier(db_name));
    if !owner.is_empty() {
        sql.push_str(&format!(" OWNER {}", quote_identifier(owner)));
    }
    sql
}

/// Creates `db_name` on the server behind `instance_ref` when it is missing.
///
/// Returns `true` when the database was created. The connecting user becomes the owner.
pub async fn ensure_database_exists(instance_ref: &str, db_name: &str) -> Result<bool> {
    let url = admin_url(instance_ref)?;
    let mut conn = PgConnection::connect(&url).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut conn)
            .await?;

    if exists {
        info!(database = db_name, "Target database already exists");
        conn.close().await?;
        return Ok(false);
    }

    let owner = Url::parse(instance_ref)?.username().to_string();
    info!(database = db_name, "Creating target database");
    sqlx::query(&create_database_sql(db_name, &owner))
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    info!(database = db_name, "✓ Database created");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_url_points_at_maintenance_db() {
        assert_eq!(
            admin_url("postgres://app:pw@db:5432/whatever").unwrap(),
            "postgres://app:pw@db:5432/postgres"
        );
    }

    #[test]
    fn create_statement_quotes_identifiers() {
        assert_eq!(
            create_database_sql("production_db", "app"),
            r#"CREATE DATABASE "production_db" OWNER "app""#
        );
        assert_eq!(
            create_database_sql(r#"odd"name"#, ""),
            r#"CREATE DATABASE "odd""name""#
        );
    }
}
