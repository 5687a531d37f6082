//! Regional-registry delegation feed.
//!
//! Lines look like `apnic|CN|ipv4|1.0.1.0|256|20110414|allocated`. IPv4
//! entries carry a host count, IPv6 entries a prefix length. Lines starting
//! with `#` are comments.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::RangeIndex;
use crate::error::RefreshError;
use crate::fetch::HttpClient;

/// Default location of the APNIC delegation statistics.
pub const DEFAULT_FEED_URL: &str = "https://ftp.apnic.net/apnic/stats/apnic/delegated-apnic-latest";

const FIELD_COUNT: usize = 6;

/// Address family tag used in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ipv4" => Some(Family::V4),
            "ipv6" => Some(Family::V6),
            _ => None,
        }
    }
}

/// Which feed entries end up in the domestic index.
#[derive(Debug, Clone)]
pub struct FeedFilter {
    pub country: String,
    pub families: Vec<Family>,
}

impl FeedFilter {
    pub fn new(country: impl Into<String>, families: Vec<Family>) -> Self {
        Self {
            country: country.into(),
            families,
        }
    }

    fn accepts(&self, country: &str, family: Family) -> bool {
        country.eq_ignore_ascii_case(&self.country) && self.families.contains(&family)
    }
}

impl Default for FeedFilter {
    fn default() -> Self {
        Self::new("CN", vec![Family::V4, Family::V6])
    }
}

/// Extracts CIDR literals for the filtered country and families.
///
/// `cancel` is checked once per line; a cancelled parse returns
/// [`RefreshError::Cancelled`].
pub fn parse_feed(
    text: &str,
    filter: &FeedFilter,
    cancel: &CancellationToken,
) -> Result<Vec<String>, RefreshError> {
    let mut cidrs = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled);
        }

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(FIELD_COUNT, '|').collect();
        if parts.len() != FIELD_COUNT {
            continue;
        }

        let (country, tag, start, value) = (parts[1], parts[2], parts[3], parts[4]);
        let Some(family) = Family::from_tag(tag) else {
            continue;
        };
        if !filter.accepts(country, family) {
            continue;
        }

        let value: u64 = value.parse().map_err(|_| RefreshError::Parse {
            line: idx + 1,
            reason: format!("invalid size {value:?}"),
        })?;

        let prefix = match family {
            Family::V4 => {
                if value == 0 {
                    return Err(RefreshError::Parse {
                        line: idx + 1,
                        reason: "zero host count".to_string(),
                    });
                }
                // host count -> prefix length; non powers of two floor
                32u32.saturating_sub(value.ilog2()) as u64
            }
            Family::V6 => value,
        };

        cidrs.push(format!("{start}/{prefix}"));
    }

    Ok(cidrs)
}

/// Reads a local copy of the feed, e.g. to seed the domestic index at startup.
pub async fn load_file(path: &Path, filter: &FeedFilter) -> Result<Vec<String>, RefreshError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_feed(&text, filter, &CancellationToken::new())
}

/// Swaps `index` to the ranges in `text`.
///
/// An empty result is a failure and leaves `index` untouched, as does any
/// parse error.
pub fn apply_feed(
    text: &str,
    index: &RangeIndex,
    filter: &FeedFilter,
    cancel: &CancellationToken,
) -> Result<usize, RefreshError> {
    let cidrs = parse_feed(text, filter, cancel)?;
    if cidrs.is_empty() {
        return Err(RefreshError::Empty);
    }
    Ok(index.replace(&cidrs)?)
}

/// Downloads the feed from `url` and replaces the domestic index.
pub async fn refresh(
    client: &HttpClient,
    url: &str,
    index: &RangeIndex,
    filter: &FeedFilter,
    cancel: &CancellationToken,
) -> Result<usize, RefreshError> {
    debug!("fetching range feed from {}", url);
    let body = tokio::select! {
        body = client.get(url, &[]) => body?,
        _ = cancel.cancelled() => return Err(RefreshError::Cancelled),
    };

    let text = String::from_utf8_lossy(&body);
    let count = apply_feed(&text, index, filter, cancel)?;
    info!("range index refreshed: {} ranges for {}", count, filter.country);

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    const FEED: &str = "\
2|apnic|20240101|1|19830613|20240101|+1000
# comment line
apnic|*|ipv4|*|5|summary
apnic|CN|ipv4|1.0.1.0|256|20110414|allocated
apnic|CN|ipv4|1.0.8.0|2048|20110412|allocated
apnic|JP|ipv4|1.0.16.0|4096|20110412|allocated
apnic|CN|ipv6|2001:da8::|32|20000101|allocated
apnic|CN|asn|4134|1|20000101|allocated
";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_feed_filters_country_and_family() {
        let cidrs = parse_feed(FEED, &FeedFilter::default(), &CancellationToken::new()).unwrap();

        assert_eq!(cidrs, vec!["1.0.1.0/24", "1.0.8.0/21", "2001:da8::/32"]);
    }

    #[test]
    fn parse_feed_respects_family_filter() {
        let filter = FeedFilter::new("CN", vec![Family::V4]);
        let cidrs = parse_feed(FEED, &filter, &CancellationToken::new()).unwrap();

        assert_eq!(cidrs, vec!["1.0.1.0/24", "1.0.8.0/21"]);
    }

    #[test]
    fn parse_feed_country_is_case_insensitive() {
        let filter = FeedFilter::new("jp", vec![Family::V4]);
        let cidrs = parse_feed(FEED, &filter, &CancellationToken::new()).unwrap();

        assert_eq!(cidrs, vec!["1.0.16.0/20"]);
    }

    #[test]
    fn parse_feed_floors_odd_host_counts() {
        let feed = "apnic|CN|ipv4|10.0.0.0|768|20110414|allocated\n";
        let cidrs = parse_feed(feed, &FeedFilter::default(), &CancellationToken::new()).unwrap();

        assert_eq!(cidrs, vec!["10.0.0.0/23"]);
    }

    #[test]
    fn parse_feed_rejects_bad_counts() {
        let feed = "apnic|CN|ipv4|10.0.0.0|lots|20110414|allocated\n";
        let err = parse_feed(feed, &FeedFilter::default(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RefreshError::Parse { line: 1, .. }));

        let feed = "apnic|CN|ipv4|10.0.0.0|0|20110414|allocated\n";
        let err = parse_feed(feed, &FeedFilter::default(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RefreshError::Parse { .. }));
    }

    #[test]
    fn parse_feed_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = parse_feed(FEED, &FeedFilter::default(), &cancel).unwrap_err();

        assert!(matches!(err, RefreshError::Cancelled));
    }

    #[test]
    fn apply_feed_replaces_index() {
        let index = RangeIndex::empty();

        let count = apply_feed(FEED, &index, &FeedFilter::default(), &CancellationToken::new())
            .unwrap();

        assert_eq!(count, 3);
        assert!(index.contains(ip("1.0.1.77")));
        assert!(index.contains(ip("1.0.15.1")));
        assert!(index.contains(ip("2001:da8:1001:7::88")));
        assert!(!index.contains(ip("1.0.16.1")));
        assert!(!index.contains(ip("172.217.11.68")));
    }

    #[test]
    fn apply_feed_keeps_index_on_empty_or_garbled_feed() {
        let index = RangeIndex::build(&["1.0.1.0/24"]).unwrap();
        let cancel = CancellationToken::new();

        for feed in ["", "# only comments\n", "garbage\nmore|garbage\n", "a|CN|ipv4|x.y|256|z|w\n"] {
            assert!(apply_feed(feed, &index, &FeedFilter::default(), &cancel).is_err());
            assert!(index.contains(ip("1.0.1.1")));
            assert_eq!(index.len(), 1);
        }
    }

    #[tokio::test]
    async fn load_file_reads_local_feed() {
        let path = std::env::temp_dir().join(format!("misha-feed-{}.txt", std::process::id()));
        tokio::fs::write(&path, FEED).await.unwrap();

        let cidrs = load_file(&path, &FeedFilter::default()).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(cidrs.len(), 3);
    }

    #[tokio::test]
    async fn load_file_missing_is_io_error() {
        let err = load_file(Path::new("/nonexistent/misha/feed"), &FeedFilter::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::Io(_)));
    }
}
