//! Schema transfer: read the source table's CREATE TABLE and replay it at the
//! destination under the destination table name.

use anyhow::{anyhow, Context, Result};
use mysql_async::prelude::*;
use mysql_async::Conn;

/// Reads the CREATE TABLE statement for `table` from the source.
pub async fn fetch_create_table(conn: &mut Conn, table: &str) -> Result<String> {
    let row: Option<(String, String)> = conn
        .query_first(format!("SHOW CREATE TABLE {table}"))
        .await
        .with_context(|| format!("could not read schema of {table}"))?;
    let (_, ddl) = row.ok_or_else(|| anyhow!("source has no table {table}"))?;
    Ok(ddl)
}

/// Rewrites the first line of a CREATE TABLE statement to use `new_name`.
///
/// Everything from the column list down is preserved verbatim.
pub fn rewrite_table_name(ddl: &str, new_name: &str) -> Result<String> {
    let Some((_, rest)) = ddl.split_once('\n') else {
        return Err(anyhow!("unexpected single-line create statement: {ddl:?}"));
    };
    Ok(format!("CREATE TABLE `{new_name}` (\n{rest}"))
}

/// Creates `dst_table` at the destination with the source table's definition.
///
/// A creation failure is only a warning: copying into a table that already
/// exists is supported.
pub async fn transfer(
    src_conn: &mut Conn,
    dst_conn: &mut Conn,
    src_table: &str,
    dst_table: &str,
) -> Result<()> {
    let ddl = fetch_create_table(src_conn, src_table).await?;
    let ddl = rewrite_table_name(&ddl, dst_table)?;
    tracing::debug!("creating destination table {dst_table}");
    if let Err(error) = dst_conn.query_drop(ddl).await {
        tracing::warn!("cannot create table {dst_table}: {error:#}");
    }
    Ok(())
}
