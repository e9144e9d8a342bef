use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use invoice_sync_core::ProviderId;
use invoice_sync_util::{Secret, WebhookSecrets};

/// Checks provider HMAC-SHA256 signatures over raw request bodies.
#[derive(Clone, Default)]
pub struct SignatureVerifier {
    secrets: WebhookSecrets,
}

impl SignatureVerifier {
    pub fn new(secrets: WebhookSecrets) -> Self {
        Self { secrets }
    }

    fn secret(&self, provider: ProviderId) -> Option<&Secret> {
        match provider {
            ProviderId::Alchemy => self.secrets.alchemy.as_ref(),
            ProviderId::Quicknode => self.secrets.quicknode.as_ref(),
            ProviderId::Rpc => None,
        }
    }

    /// Returns `true` only when `header` carries the hex HMAC of `raw_body`
    /// under the provider's secret. Any missing piece fails closed.
    pub fn verify(&self, provider: ProviderId, raw_body: &[u8], header: Option<&str>) -> bool {
        match self.check(provider, raw_body, header) {
            Ok(()) => true,
            Err(reason) => {
                warn!(stage = "ingress", provider = %provider, reason, "signature verification failed");
                false
            }
        }
    }

    fn check(
        &self,
        provider: ProviderId,
        raw_body: &[u8],
        header: Option<&str>,
    ) -> Result<(), &'static str> {
        let secret = self.secret(provider).ok_or("signing secret not configured")?;
        let header = header
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or("signature header missing")?;
        let hex_part = header.strip_prefix("sha256=").unwrap_or(header);
        let provided = hex::decode(hex_part).map_err(|_| "signature is not valid hex")?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose())
            .map_err(|_| "failed to initialize signature verifier")?;
        mac.update(raw_body);
        let expected = mac.finalize().into_bytes();
        let expected_bytes: &[u8] = expected.as_ref();

        if expected_bytes.ct_eq(provided.as_slice()).into() {
            Ok(())
        } else {
            Err("signature mismatch")
        }
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
