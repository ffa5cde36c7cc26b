pub mod azure_ad;
pub mod connection_string;
pub mod provider;
pub mod sas_token;

pub use azure_ad::{AzureAdConfig, ClientCredentialsProvider};
pub use connection_string::{ConnectionStringInfo, normalize_endpoint};
pub use provider::{AuthProvider, AuthToken, StaticTokenProvider};
pub use sas_token::SasTokenGenerator;
