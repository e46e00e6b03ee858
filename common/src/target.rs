use anyhow::{anyhow, Context};

/// One copy endpoint, parsed from a `host[:port]/db[/table]` spec.
///
/// The table component is optional on the destination side; the copy reuses the
/// source table name when it is omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub table: Option<String>,
}

pub const DEFAULT_PORT: u16 = 3306;

impl Target {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let mut parts = spec.splitn(3, '/');
        let hostport = parts.next().unwrap_or_default();
        let db = parts
            .next()
            .filter(|db| !db.is_empty())
            .ok_or_else(|| anyhow!("no database name specified in {spec:?}"))?;
        let table = parts.next().filter(|table| !table.is_empty());
        let (host, port) = match hostport.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid port {port:?} in {spec:?}"))?;
                (host, port)
            }
            None => (hostport, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(anyhow!("no host specified in {spec:?}"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            db: db.to_string(),
            table: table.map(str::to_string),
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)?;
        if let Some(table) = &self.table {
            write!(f, "/{table}")?;
        }
        Ok(())
    }
}
