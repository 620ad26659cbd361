/// 网关与客户端的 TLS 配置
///
/// 网关：加载配置的证书，两者都缺省时生成一次性自签名证书。
/// 客户端：信任配置的 CA，否则使用系统根证书；`skip_verify` 只跳过证书链与主机名校验，
/// 握手签名仍然校验。
use anyhow::{bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::config::{GatewayConfig, HostConfig};

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;
    if certs.is_empty() {
        bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// 网关的 TLS 配置
pub fn gateway_config(config: &GatewayConfig) -> Result<Arc<rustls::ServerConfig>> {
    let (cert_path, key_path) = gateway_cert_paths(config)?;
    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_certs(&cert_path)?, read_key(&key_path)?)
        .context("Certificate and private key do not match")?;
    Ok(Arc::new(server))
}

/// 证书与私钥要么都配置，要么都缺省（生成自签名证书）
fn gateway_cert_paths(config: &GatewayConfig) -> Result<(PathBuf, PathBuf)> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
        (None, None) => {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let dir = std::env::temp_dir();
            let cert_path = dir.join(format!("tunnel-relay-cert-{}.pem", nanos));
            let key_path = dir.join(format!("tunnel-relay-key-{}.pem", nanos));

            // 通配地址不能作为证书名称
            let name = match config.bind_addr.as_str() {
                "0.0.0.0" | "::" => "localhost",
                addr => addr,
            };
            write_self_signed(name, &[], &cert_path, &key_path)?;
            info!("Gateway using self-signed certificate {:?}", cert_path);

            Ok((cert_path, key_path))
        }
        _ => bail!("Both cert_path and key_path must be set, or leave both empty to auto-generate"),
    }
}

/// 连接主机时使用的 TLS 配置
pub fn host_config(host: &HostConfig) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    match &host.ca_cert_path {
        Some(ca) => {
            for cert in read_certs(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {:?}", ca))?;
            }
        }
        None if !host.skip_verify => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!("Failed to load a system root certificate: {}", error);
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            if added == 0 {
                warn!("No usable system root certificates ({} ignored)", ignored);
            }
        }
        None => {}
    }

    let mut client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if host.skip_verify {
        warn!("Certificate verification disabled for {}", host.address);
        let provider = client.crypto_provider().clone();
        client
            .dangerous()
            .set_certificate_verifier(Arc::new(AnyServerCert { provider }));
    }

    Ok(Arc::new(client))
}

/// 生成自签名证书，`common_name` 总会出现在 SAN 中
pub fn write_self_signed(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    let mut names = alt_names.to_vec();
    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let generated = rcgen::generate_simple_self_signed(names)
        .context("Failed to generate self-signed certificate")?;
    std::fs::write(cert_out, generated.cert.pem())
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, generated.signing_key.serialize_pem())
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;
    Ok(())
}

/// 接受任意服务器证书，仍用密码套件提供者校验握手签名
#[derive(Debug)]
struct AnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tunnel-relay-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_configured_gateway_cert_trusted_by_host() {
        let dir = temp_dir("tls-pair");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        write_self_signed("localhost", &["127.0.0.1".to_string()], &cert, &key).unwrap();

        let mut gateway = GatewayConfig::new("127.0.0.1", 0);
        gateway.cert_path = Some(cert.clone());
        gateway.key_path = Some(key);
        assert!(gateway_config(&gateway).is_ok());

        let mut host = HostConfig::new("localhost:7443", "alice");
        host.ca_cert_path = Some(cert);
        assert!(host_config(&host).is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_gateway_generates_cert_when_unset() {
        let gateway = GatewayConfig::new("0.0.0.0", 0);
        assert!(gateway_config(&gateway).is_ok());
    }

    #[test]
    fn test_half_configured_certs_rejected() {
        let mut gateway = GatewayConfig::new("127.0.0.1", 0);
        gateway.cert_path = Some(PathBuf::from("cert.pem"));
        assert!(gateway_config(&gateway).is_err());
    }

    #[test]
    fn test_ca_file_without_certificates_rejected() {
        let dir = temp_dir("tls-empty-ca");
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, "not a certificate\n").unwrap();

        let mut host = HostConfig::new("localhost:7443", "alice");
        host.ca_cert_path = Some(ca);
        assert!(host_config(&host).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_skip_verify_builds_without_roots() {
        let mut host = HostConfig::new("localhost:7443", "alice");
        host.skip_verify = true;
        assert!(host_config(&host).is_ok());
    }
}
