//! tokio-postgres implementation of the connection seam.

use async_trait::async_trait;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use super::value::convert_pg_row_value;
use super::{Connector, RowSet, SqlConnection, SqlValue};
use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};

/// Opens PostgreSQL sessions for one configured database.
pub struct PgConnector {
    config: DatabaseConfig,
}

impl PgConnector {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn pg_config(&self) -> PgConfig {
        let mut pg_config = PgConfig::new();
        pg_config.host(&self.config.host);
        pg_config.port(self.config.port);
        pg_config.dbname(&self.config.database);
        pg_config.user(&self.config.user);
        pg_config.password(&self.config.password);
        pg_config.connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));
        pg_config.application_name("dspace-pump");
        if self.config.statement_timeout_secs > 0 {
            pg_config.options(&format!(
                "-c statement_timeout={}s",
                self.config.statement_timeout_secs
            ));
        }
        pg_config
    }

    /// Build TLS configuration based on ssl_mode.
    fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = match ssl_mode {
            "require" => {
                warn!(
                    "ssl_mode=require: TLS enabled but server certificate is not verified. \
                     Consider using 'verify-full' for production."
                );
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            "verify-full" => ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
            other => {
                return Err(MigrateError::Config(format!(
                    "Invalid ssl_mode '{}'. Valid options: disable, require, verify-full",
                    other
                )));
            }
        };

        Ok(config)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let pg_config = self.pg_config();
        let context = self.describe();

        let client = if self.config.ssl_mode == "disable" {
            let (client, connection) = pg_config
                .connect(NoTls)
                .await
                .map_err(|e| MigrateError::connection(e.to_string(), context.clone()))?;
            let name = context.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("{}: connection ended: {}", name, e);
                }
            });
            client
        } else {
            let tls = MakeRustlsConnect::new(Self::build_tls_config(&self.config.ssl_mode)?);
            let (client, connection) = pg_config
                .connect(tls)
                .await
                .map_err(|e| MigrateError::connection(e.to_string(), context.clone()))?;
            let name = context.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("{}: connection ended: {}", name, e);
                }
            });
            client
        };

        info!("Connected to PostgreSQL: {}", context);
        Ok(Box::new(PgConnection { client }))
    }

    fn describe(&self) -> String {
        self.config.describe()
    }
}

struct PgConnection {
    client: Client,
}

fn bind(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params.iter().map(SqlValue::to_param).collect()
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        let boxed = bind(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(sql, &refs).await?;

        let columns = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => Vec::new(),
        };
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| convert_pg_row_value(row, i)).collect())
            .collect();
        Ok(RowSet { columns, rows })
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let boxed = bind(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        Ok(self.client.execute(sql, &refs).await?)
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        Ok(self.client.batch_execute(sql).await?)
    }
}

/// Certificate verifier that accepts any certificate.
///
/// Only used for `ssl_mode=require`, which asks for encryption without
/// server identity checks. Use `verify-full` on untrusted networks.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(statement_timeout_secs: u64) -> DatabaseConfig {
        DatabaseConfig {
            host: "legacy".to_string(),
            port: 5432,
            database: "clarin-dspace".to_string(),
            user: "dspace".to_string(),
            password: "secret".to_string(),
            ssl_mode: "disable".to_string(),
            connect_timeout_secs: 10,
            statement_timeout_secs,
        }
    }

    #[test]
    fn test_statement_timeout_is_sent_as_session_option() {
        let pg_config = PgConnector::new(&config(600)).pg_config();
        assert_eq!(pg_config.get_options(), Some("-c statement_timeout=600s"));
        assert_eq!(pg_config.get_connect_timeout(), Some(&Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_statement_timeout_sends_no_option() {
        let pg_config = PgConnector::new(&config(0)).pg_config();
        assert_eq!(pg_config.get_options(), None);
    }

    #[test]
    fn test_unknown_ssl_mode_is_rejected() {
        assert!(PgConnector::build_tls_config("prefer").is_err());
    }
}
