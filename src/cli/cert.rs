use anyhow::Result;
use std::path::Path;

use crate::tls;

/// Generate self-signed TLS certificate
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    tls::write_self_signed(common_name, alt_names, Path::new(cert_out), Path::new(key_out))?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);

    Ok(())
}
