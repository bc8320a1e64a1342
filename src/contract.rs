use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Keywords that usually accompany a token launch or contract drop.
const CRYPTO_KEYWORDS: &[&str] = &[
    "$BTC",
    "$ETH",
    "$SOL",
    "$USDT",
    "$USDC",
    "CA:",
    "Contract:",
    "DeFi",
    "NFT",
    "Token",
    "CA =",
    "Contract Address",
    "Smart Contract",
    "Token Address",
    "Contract Addr",
];

/// One tagged finding from a block of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractInfo {
    /// Base58 token of 32 to 44 characters.
    Solana(String),
    /// `0x` followed by exactly 40 hex digits.
    Ethereum(String),
    /// Every keyword from the fixed list that appears in the text.
    Keywords(Vec<String>),
}

impl fmt::Display for ContractInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractInfo::Solana(address) => write!(f, "🟣 Solana: `{}`", address),
            ContractInfo::Ethereum(address) => write!(f, "🔷 Ethereum: `{}`", address),
            ContractInfo::Keywords(keywords) => write!(f, "🏷️ Keywords: {}", keywords.join(", ")),
        }
    }
}

fn solana_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").expect("static base58 pattern")
    })
}

fn ethereum_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("static hex pattern"))
}

/// Extract address candidates and launch keywords from free text.
///
/// Results are ordered: base58 matches, then hex matches, then a single
/// keyword entry. The same text always yields the same list.
pub fn extract_contract_info(text: &str) -> Vec<ContractInfo> {
    let mut info = Vec::new();
    if text.is_empty() {
        return info;
    }

    info.extend(
        solana_pattern()
            .find_iter(text)
            .map(|m| ContractInfo::Solana(m.as_str().to_string())),
    );
    info.extend(
        ethereum_pattern()
            .find_iter(text)
            .map(|m| ContractInfo::Ethereum(m.as_str().to_string())),
    );

    let upper = text.to_uppercase();
    let keywords: Vec<String> = CRYPTO_KEYWORDS
        .iter()
        .filter(|keyword| upper.contains(&keyword.to_uppercase()))
        .map(|keyword| keyword.to_string())
        .collect();
    if !keywords.is_empty() {
        info.push(ContractInfo::Keywords(keywords));
    }

    info
}
