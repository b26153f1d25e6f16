use crate::error::{Error, Result};
use reqwest::Url;
use std::fmt;
use std::time::Duration;

/// Where a chain id came from, for mismatch reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainSource {
    Config,
    Signer,
    BundlerUrl,
    PaymasterUrl,
}

impl fmt::Display for ChainSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainSource::Config => "configuration",
            ChainSource::Signer => "signer",
            ChainSource::BundlerUrl => "bundler url",
            ChainSource::PaymasterUrl => "paymaster url",
        })
    }
}

/// Extracts `<chainId>` from `https://<host>/api/v<N>/<chainId>/<key>`.
pub fn chain_id_from_url(url: &str) -> Result<u64> {
    try_chain_id_from_url(url)?.ok_or_else(|| Error::InvalidChainId(url.to_string()))
}

/// Like [`chain_id_from_url`], but a well-formed URL that simply does not
/// follow the convention yields `Ok(None)`.
pub fn try_chain_id_from_url(url: &str) -> Result<Option<u64>> {
    let parsed = Url::parse(url).map_err(|e| Error::MalformedUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let segments: Vec<&str> = match parsed.path_segments() {
        Some(s) => s.filter(|s| !s.is_empty()).collect(),
        None => return Ok(None),
    };

    Ok(segments.windows(4).find_map(|w| match w {
        ["api", version, chain_id, key] if is_version(version) && !key.is_empty() => {
            chain_id.parse::<u64>().ok()
        }
        _ => None,
    }))
}

fn is_version(s: &str) -> bool {
    s.strip_prefix('v')
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Every pair of available chain ids must agree; unavailable ones are skipped.
pub fn ensure_consistent(sources: &[(ChainSource, Option<u64>)]) -> Result<()> {
    let known: Vec<(ChainSource, u64)> = sources
        .iter()
        .filter_map(|(src, id)| id.map(|id| (*src, id)))
        .collect();

    for (i, (left, left_id)) in known.iter().enumerate() {
        for (right, right_id) in &known[i + 1..] {
            if left_id != right_id {
                return Err(Error::ChainIdMismatch {
                    left: *left,
                    left_id: *left_id,
                    right: *right,
                    right_id: *right_id,
                });
            }
        }
    }
    Ok(())
}

/// Checks bundler URL, paymaster URL and any known ids against each other.
pub fn check_service_urls(
    bundler_url: &str,
    paymaster_url: Option<&str>,
    signer_chain_id: Option<u64>,
    configured_chain_id: Option<u64>,
) -> Result<()> {
    let bundler = try_chain_id_from_url(bundler_url)?;
    let paymaster = paymaster_url.map(try_chain_id_from_url).transpose()?.flatten();
    ensure_consistent(&[
        (ChainSource::Config, configured_chain_id),
        (ChainSource::Signer, signer_chain_id),
        (ChainSource::BundlerUrl, bundler),
        (ChainSource::PaymasterUrl, paymaster),
    ])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainInfo {
    pub id: u64,
    pub name: &'static str,
    pub native_currency: NativeCurrency,
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
    /// How often to ask the bundler for a receipt on this chain.
    pub receipt_poll_interval: Duration,
}

const ETHER: NativeCurrency = NativeCurrency {
    name: "Ether",
    symbol: "ETH",
    decimals: 18,
};

const MATIC: NativeCurrency = NativeCurrency {
    name: "MATIC",
    symbol: "MATIC",
    decimals: 18,
};

pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

static CHAINS: &[ChainInfo] = &[
    ChainInfo {
        id: 1,
        name: "Ethereum",
        native_currency: ETHER,
        rpc_url: "https://eth.llamarpc.com",
        explorer_url: "https://etherscan.io",
        receipt_poll_interval: Duration::from_secs(4),
    },
    ChainInfo {
        id: 11_155_111,
        name: "Sepolia",
        native_currency: ETHER,
        rpc_url: "https://rpc.sepolia.org",
        explorer_url: "https://sepolia.etherscan.io",
        receipt_poll_interval: Duration::from_secs(4),
    },
    ChainInfo {
        id: 137,
        name: "Polygon",
        native_currency: MATIC,
        rpc_url: "https://polygon-rpc.com",
        explorer_url: "https://polygonscan.com",
        receipt_poll_interval: Duration::from_millis(1500),
    },
    ChainInfo {
        id: 80_001,
        name: "Polygon Mumbai",
        native_currency: MATIC,
        rpc_url: "https://rpc-mumbai.maticvigil.com",
        explorer_url: "https://mumbai.polygonscan.com",
        receipt_poll_interval: Duration::from_millis(1500),
    },
    ChainInfo {
        id: 10,
        name: "OP Mainnet",
        native_currency: ETHER,
        rpc_url: "https://mainnet.optimism.io",
        explorer_url: "https://optimistic.etherscan.io",
        receipt_poll_interval: Duration::from_millis(1000),
    },
    ChainInfo {
        id: 42_161,
        name: "Arbitrum One",
        native_currency: ETHER,
        rpc_url: "https://arb1.arbitrum.io/rpc",
        explorer_url: "https://arbiscan.io",
        receipt_poll_interval: Duration::from_millis(500),
    },
    ChainInfo {
        id: 8453,
        name: "Base",
        native_currency: ETHER,
        rpc_url: "https://mainnet.base.org",
        explorer_url: "https://basescan.org",
        receipt_poll_interval: Duration::from_millis(1000),
    },
    ChainInfo {
        id: 84_532,
        name: "Base Sepolia",
        native_currency: ETHER,
        rpc_url: "https://sepolia.base.org",
        explorer_url: "https://sepolia.basescan.org",
        receipt_poll_interval: Duration::from_millis(1000),
    },
];

pub fn chain_info(chain_id: u64) -> Option<&'static ChainInfo> {
    CHAINS.iter().find(|c| c.id == chain_id)
}

pub fn receipt_poll_interval(chain_id: u64) -> Duration {
    chain_info(chain_id)
        .map(|c| c.receipt_poll_interval)
        .unwrap_or(DEFAULT_RECEIPT_POLL_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn extracts_chain_id_from_service_url() {
        assert_eq!(
            chain_id_from_url("https://bundler.example/api/v2/80001/abc123").unwrap(),
            80_001
        );
        assert_eq!(
            chain_id_from_url("https://paymaster.example/api/v1/137/key?x=1").unwrap(),
            137
        );
    }

    #[test]
    fn rejects_urls_without_the_convention() {
        for url in [
            "https://base-sepolia.g.alchemy.com/v2/key",
            "https://bundler.example/api/v2/80001",
            "https://bundler.example/api/2/80001/key",
            "https://bundler.example/api/v2/mumbai/key",
        ] {
            let err = chain_id_from_url(url).unwrap_err();
            assert!(matches!(err, Error::InvalidChainId(_)), "{url}");
        }
    }

    #[test]
    fn malformed_url_is_a_validation_error() {
        let err = try_chain_id_from_url("not a url").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn mismatched_bundler_and_paymaster_urls_fail() {
        let err = check_service_urls(
            "https://bundler.example/api/v2/80001/abc123",
            Some("https://paymaster.example/api/v2/137/abc123"),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        match err {
            Error::ChainIdMismatch {
                left_id, right_id, ..
            } => assert_eq!((left_id, right_id), (80_001, 137)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn signer_chain_must_match_urls() {
        let err = check_service_urls(
            "https://bundler.example/api/v2/80001/abc123",
            None,
            Some(1),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ChainIdMismatch {
                left: ChainSource::Signer,
                right: ChainSource::BundlerUrl,
                ..
            }
        ));
    }

    #[test]
    fn unavailable_sources_are_skipped() {
        check_service_urls(
            "https://base-sepolia.g.alchemy.com/v2/key",
            Some("https://paymaster.example/api/v2/84532/k"),
            Some(84_532),
            Some(84_532),
        )
        .unwrap();
        ensure_consistent(&[(ChainSource::Signer, Some(5)), (ChainSource::BundlerUrl, None)])
            .unwrap();
    }

    #[test]
    fn registry_lookup() {
        let base = chain_info(8453).unwrap();
        assert_eq!(base.native_currency.symbol, "ETH");
        assert_eq!(receipt_poll_interval(424_242), DEFAULT_RECEIPT_POLL_INTERVAL);
        assert_eq!(receipt_poll_interval(42_161), Duration::from_millis(500));
    }
}
