//! JSON Feed 1.1 writer.

use serde::Serialize;

use super::Channel;
use crate::error::Result;
use crate::models::ContentItem;
use crate::utils::strip_control_chars;

const VERSION: &str = "https://jsonfeed.org/version/1.1";

#[derive(Serialize)]
struct JsonFeed {
    version: &'static str,
    title: String,
    home_page_url: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    items: Vec<JsonItem>,
}

#[derive(Serialize)]
struct JsonItem {
    id: String,
    url: String,
    title: String,
    content_text: String,
    date_published: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

impl From<&ContentItem> for JsonItem {
    fn from(item: &ContentItem) -> Self {
        // content_text is required, so fall back to the title.
        let content = if item.summary.is_empty() {
            &item.title
        } else {
            &item.summary
        };
        Self {
            id: strip_control_chars(&item.guid),
            url: strip_control_chars(&item.link),
            title: strip_control_chars(&item.title),
            content_text: strip_control_chars(content),
            date_published: item
                .published_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            tags: item.categories.iter().map(|c| strip_control_chars(c)).collect(),
            image: item.image_url.as_deref().map(strip_control_chars),
        }
    }
}

pub(super) fn render(channel: &Channel, items: &[ContentItem]) -> Result<String> {
    let feed = JsonFeed {
        version: VERSION,
        title: strip_control_chars(&channel.title),
        home_page_url: channel.link.clone(),
        description: strip_control_chars(&channel.description),
        language: channel.language.clone(),
        items: items.iter().map(JsonItem::from).collect(),
    };
    Ok(serde_json::to_string_pretty(&feed)?)
}
