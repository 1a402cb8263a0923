//! Core domain model, platform taxonomy and engagement bins for ytlinks.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "ytlinks-core";

/// Cell label written for aliases that resolved to no channel.
pub const NOT_FOUND_LABEL: &str = "Not Found";
/// Cell label written for aliases whose resolution exhausted its retries.
pub const ERROR_LABEL: &str = "Error";

/// One row of the input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelQuery {
    pub alias: String,
}

impl ChannelQuery {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
        }
    }
}

/// Outcome of resolving one alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedChannel {
    Found(String),
    /// The platform confirmed there is no such channel.
    NotFound,
    /// Every attempt failed before a confirmation either way.
    Error,
}

impl ResolvedChannel {
    pub fn channel_url(&self) -> Option<&str> {
        match self {
            Self::Found(url) => Some(url),
            Self::NotFound | Self::Error => None,
        }
    }

    pub fn as_label(&self) -> &str {
        match self {
            Self::Found(url) => url,
            Self::NotFound => NOT_FOUND_LABEL,
            Self::Error => ERROR_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            NOT_FOUND_LABEL => Self::NotFound,
            ERROR_LABEL => Self::Error,
            url => Self::Found(url.to_string()),
        }
    }
}

impl fmt::Display for ResolvedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl Serialize for ResolvedChannel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_label())
    }
}

impl<'de> Deserialize<'de> for ResolvedChannel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResolution {
    pub alias: String,
    pub channel_url: ResolvedChannel,
}

/// A platform link found on a channel page, before it is tied to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLink {
    pub platform: PlatformLabel,
    pub url: String,
}

/// Social link attributed to a resolved channel URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLink {
    pub channel_url: String,
    pub platform: PlatformLabel,
    pub url: String,
}

impl SocialLink {
    pub fn new(channel_url: impl Into<String>, link: PlatformLink) -> Self {
        Self {
            channel_url: channel_url.into(),
            platform: link.platform,
            url: link.url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PlatformLabel {
    Instagram,
    TikTok,
    #[serde(rename = "X (Twitter)")]
    Twitter,
    Facebook,
    Telegram,
    Discord,
    Snapchat,
    #[serde(rename = "YouTube Channel")]
    YouTubeChannel,
    Email,
}

impl PlatformLabel {
    pub const ALL: [PlatformLabel; 9] = [
        PlatformLabel::Instagram,
        PlatformLabel::TikTok,
        PlatformLabel::Twitter,
        PlatformLabel::Facebook,
        PlatformLabel::Telegram,
        PlatformLabel::Discord,
        PlatformLabel::Snapchat,
        PlatformLabel::YouTubeChannel,
        PlatformLabel::Email,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instagram => "Instagram",
            Self::TikTok => "TikTok",
            Self::Twitter => "X (Twitter)",
            Self::Facebook => "Facebook",
            Self::Telegram => "Telegram",
            Self::Discord => "Discord",
            Self::Snapchat => "Snapchat",
            Self::YouTubeChannel => "YouTube Channel",
            Self::Email => "Email",
        }
    }
}

impl fmt::Display for PlatformLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a link's visible text and target to a platform label.
///
/// Matching is case-insensitive and the first rule that fires wins, so a
/// URL mentioning both `tiktok` and `discord` is TikTok. Never fails:
/// anything unrecognized is `None`.
pub fn normalize_platform(text: &str, url: &str) -> Option<PlatformLabel> {
    let text = text.to_lowercase();
    let url = url.to_lowercase();
    let either = |needle: &str| text.contains(needle) || url.contains(needle);

    if either("instagram") {
        Some(PlatformLabel::Instagram)
    } else if either("tiktok") {
        Some(PlatformLabel::TikTok)
    } else if either("twitter") || url.contains("x.com") {
        Some(PlatformLabel::Twitter)
    } else if either("facebook") {
        Some(PlatformLabel::Facebook)
    } else if either("telegram") || url.contains("t.me") {
        Some(PlatformLabel::Telegram)
    } else if either("discord") || url.contains("discord.gg") {
        Some(PlatformLabel::Discord)
    } else if either("snapchat") {
        Some(PlatformLabel::Snapchat)
    } else if url.contains("youtube.com/channel") || url.contains("youtube.com/c/") {
        Some(PlatformLabel::YouTubeChannel)
    } else if url.contains('@') {
        Some(PlatformLabel::Email)
    } else {
        None
    }
}

/// Average-view engagement bins, ordered from smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngagementCategory {
    Under5k,
    From5kTo10k,
    From10kTo25k,
    From25kTo50k,
    From50kTo100k,
    From100kTo250k,
    From250kTo1M,
    Over1M,
    NotAvailable,
}

/// Upper-exclusive thresholds; the last bin is unbounded.
const ENGAGEMENT_BINS: [(EngagementCategory, f64); 8] = [
    (EngagementCategory::Under5k, 5_000.0),
    (EngagementCategory::From5kTo10k, 10_000.0),
    (EngagementCategory::From10kTo25k, 25_000.0),
    (EngagementCategory::From25kTo50k, 50_000.0),
    (EngagementCategory::From50kTo100k, 100_000.0),
    (EngagementCategory::From100kTo250k, 250_000.0),
    (EngagementCategory::From250kTo1M, 1_000_000.0),
    (EngagementCategory::Over1M, f64::INFINITY),
];

impl EngagementCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Under5k => "< 5k",
            Self::From5kTo10k => "5k-10k",
            Self::From10kTo25k => "10k-25k",
            Self::From25kTo50k => "25k-50k",
            Self::From50kTo100k => "50k-100k",
            Self::From100kTo250k => "100k-250k",
            Self::From250kTo1M => "250k-1M",
            Self::Over1M => "1M+",
            Self::NotAvailable => "N/A",
        }
    }

    /// Position in the ordered bin table, `None` for `N/A`.
    pub fn rank(self) -> Option<usize> {
        ENGAGEMENT_BINS.iter().position(|(bin, _)| *bin == self)
    }
}

impl fmt::Display for EngagementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EngagementCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Bin an average view count. Absent (or NaN) counts are `N/A`; values equal
/// to a threshold land in the next bin up.
pub fn categorize_views(avg_views: Option<f64>) -> EngagementCategory {
    let Some(views) = avg_views.filter(|v| !v.is_nan()) else {
        return EngagementCategory::NotAvailable;
    };
    ENGAGEMENT_BINS
        .iter()
        .find(|(_, threshold)| views < *threshold)
        .map(|(bin, _)| *bin)
        .unwrap_or(EngagementCategory::Over1M)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instagram_keyword_matches_in_either_field() {
        assert_eq!(
            normalize_platform("Instagram", "https://example.com/me"),
            Some(PlatformLabel::Instagram)
        );
        assert_eq!(
            normalize_platform("follow me", "https://www.INSTAGRAM.com/me"),
            Some(PlatformLabel::Instagram)
        );
    }

    #[test]
    fn x_dot_com_url_is_twitter() {
        assert_eq!(
            normalize_platform("", "https://x.com/foo"),
            Some(PlatformLabel::Twitter)
        );
        assert_eq!(PlatformLabel::Twitter.as_str(), "X (Twitter)");
    }

    #[test]
    fn mailto_is_email_when_nothing_earlier_matches() {
        assert_eq!(
            normalize_platform("My Email", "mailto:a@b.com"),
            Some(PlatformLabel::Email)
        );
        assert_eq!(
            normalize_platform("Instagram", "mailto:a@b.com"),
            Some(PlatformLabel::Instagram)
        );
    }

    #[test]
    fn earlier_platform_wins_on_ties() {
        assert_eq!(
            normalize_platform("", "https://tiktok.example/discord"),
            Some(PlatformLabel::TikTok)
        );
        assert_eq!(
            normalize_platform("telegram", "https://facebook.com/page"),
            Some(PlatformLabel::Facebook)
        );
    }

    #[test]
    fn short_domains_and_channel_paths() {
        assert_eq!(
            normalize_platform("chat", "https://t.me/group"),
            Some(PlatformLabel::Telegram)
        );
        assert_eq!(
            normalize_platform("server", "https://discord.gg/abc"),
            Some(PlatformLabel::Discord)
        );
        assert_eq!(
            normalize_platform("Discord", "https://invite.example/abc"),
            Some(PlatformLabel::Discord)
        );
        assert_eq!(
            normalize_platform("second channel", "https://www.youtube.com/channel/UC123"),
            Some(PlatformLabel::YouTubeChannel)
        );
        assert_eq!(
            normalize_platform("old vanity", "https://youtube.com/c/Someone"),
            Some(PlatformLabel::YouTubeChannel)
        );
    }

    #[test]
    fn unmatched_and_malformed_input_is_none() {
        assert_eq!(normalize_platform("Merch", "https://shop.example.com"), None);
        assert_eq!(normalize_platform("", ""), None);
        assert_eq!(normalize_platform("\u{0}\u{fffd}", "::::not a url"), None);
    }

    #[test]
    fn normalizer_is_idempotent() {
        let first = normalize_platform("Snap", "https://snapchat.com/add/me");
        for _ in 0..3 {
            assert_eq!(normalize_platform("Snap", "https://snapchat.com/add/me"), first);
        }
    }

    #[test]
    fn categorize_boundaries_fall_into_next_bin() {
        assert_eq!(categorize_views(Some(4_999.0)).as_str(), "< 5k");
        assert_eq!(categorize_views(Some(5_000.0)).as_str(), "5k-10k");
        assert_eq!(categorize_views(Some(249_999.0)).as_str(), "100k-250k");
        assert_eq!(categorize_views(Some(999_999.0)).as_str(), "250k-1M");
        assert_eq!(categorize_views(Some(1_000_000.0)).as_str(), "1M+");
        assert_eq!(categorize_views(None).as_str(), "N/A");
        assert_eq!(categorize_views(Some(f64::NAN)).as_str(), "N/A");
    }

    #[test]
    fn zero_and_negative_views_are_lowest_bin() {
        assert_eq!(categorize_views(Some(0.0)), EngagementCategory::Under5k);
        assert_eq!(categorize_views(Some(-12.0)), EngagementCategory::Under5k);
    }

    #[test]
    fn categorize_is_monotonic() {
        let mut last = 0usize;
        let mut views = -100.0;
        while views < 3_000_000.0 {
            let rank = categorize_views(Some(views)).rank().unwrap();
            assert!(rank >= last, "rank dropped at {views}");
            last = rank;
            views += 997.0;
        }
        assert_eq!(last, 7);
    }

    #[test]
    fn sentinel_labels_round_trip_through_serde() {
        let resolution = ChannelResolution {
            alias: "ghost".into(),
            channel_url: ResolvedChannel::NotFound,
        };
        let json = serde_json::to_string(&resolution).unwrap();
        assert_eq!(json, r#"{"alias":"ghost","channel_url":"Not Found"}"#);
        let back: ChannelResolution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resolution);
        assert_eq!(ResolvedChannel::from_label("Error"), ResolvedChannel::Error);
    }

    #[test]
    fn platform_labels_serialize_as_display_names() {
        for label in PlatformLabel::ALL {
            let json = serde_json::to_string(&label).unwrap();
            assert_eq!(json, format!("\"{}\"", label.as_str()));
            assert_eq!(serde_json::from_str::<PlatformLabel>(&json).unwrap(), label);
        }
    }
}
