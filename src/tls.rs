/// Use ring as the process wide rustls crypto provider.
///
/// Every `wss://` connection needs a provider, installing it more than once is harmless.
pub fn install_crypto_provider() {
	if rustls::crypto::CryptoProvider::get_default().is_none() {
		if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
			tracing::debug!("A rustls crypto provider was installed concurrently: {e:?}");
		}
	}
}
