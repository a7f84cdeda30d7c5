//! RSS 2.0 writer.

use std::io::Write;

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Channel;
use crate::error::{AppError, Result};
use crate::models::ContentItem;
use crate::utils::strip_control_chars;

pub(super) fn render(
    channel: &Channel,
    items: &[ContentItem],
    generated_at: DateTime<Utc>,
) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(AppError::render)?;
    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(rss))
        .map_err(AppError::render)?;
    writer
        .write_event(Event::Start(BytesStart::new("channel")))
        .map_err(AppError::render)?;

    text_element(&mut writer, "title", &channel.title)?;
    text_element(&mut writer, "link", &channel.link)?;
    text_element(&mut writer, "description", &channel.description)?;
    if let Some(language) = &channel.language {
        text_element(&mut writer, "language", language)?;
    }
    text_element(&mut writer, "generator", "feedhub")?;
    text_element(&mut writer, "lastBuildDate", &generated_at.to_rfc2822())?;

    for item in items {
        write_item(&mut writer, item)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("channel")))
        .map_err(AppError::render)?;
    writer
        .write_event(Event::End(BytesEnd::new("rss")))
        .map_err(AppError::render)?;

    String::from_utf8(writer.into_inner()).map_err(AppError::render)
}

fn write_item<W: Write>(writer: &mut Writer<W>, item: &ContentItem) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new("item")))
        .map_err(AppError::render)?;

    text_element(writer, "title", &item.title)?;
    text_element(writer, "link", &item.link)?;

    let permalink = if item.guid == item.link { "true" } else { "false" };
    writer
        .create_element("guid")
        .with_attribute(("isPermaLink", permalink))
        .write_text_content(BytesText::new(&strip_control_chars(&item.guid)))
        .map_err(AppError::render)?;

    text_element(writer, "pubDate", &item.published_at.to_rfc2822())?;
    if !item.summary.is_empty() {
        text_element(writer, "description", &item.summary)?;
    }
    for category in &item.categories {
        text_element(writer, "category", category)?;
    }
    if let Some(image) = &item.image_url {
        let url = strip_control_chars(image);
        writer
            .create_element("enclosure")
            .with_attribute(("url", url.as_str()))
            .with_attribute(("length", "0"))
            .with_attribute(("type", image_mime(&url)))
            .write_empty()
            .map_err(AppError::render)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("item")))
        .map_err(AppError::render)?;
    Ok(())
}

fn text_element<W: Write>(writer: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(&strip_control_chars(text)))
        .map_err(AppError::render)?;
    Ok(())
}

/// MIME type for an enclosure, guessed from the path extension.
fn image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn channel() -> Channel {
        Channel {
            title: "News & Notes".into(),
            link: "https://example.com/".into(),
            description: "Latest".into(),
            language: Some("en-US".into()),
        }
    }

    fn item() -> ContentItem {
        ContentItem {
            source_id: "en".into(),
            guid: "g-1".into(),
            title: "<b>Big</b> \u{1}news".into(),
            link: "https://example.com/a?x=1&y=2".into(),
            published_at: Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap(),
            summary: "Summary".into(),
            categories: vec!["Tech".into()],
            image_url: Some("https://example.com/i.PNG".into()),
        }
    }

    #[test]
    fn test_renders_escaped_channel_and_item() {
        let generated = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();
        let xml = render(&channel(), &[item()], generated).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<rss version=\"2.0\">"));
        assert!(xml.contains("<title>News &amp; Notes</title>"));
        assert!(xml.contains("<title>&lt;b&gt;Big&lt;/b&gt; news</title>"));
        assert!(xml.contains("<link>https://example.com/a?x=1&amp;y=2</link>"));
        assert!(xml.contains("<guid isPermaLink=\"false\">g-1</guid>"));
        assert!(xml.contains("Feb 2026 10:00:00 +0000</pubDate>"));
        assert!(xml.contains("<category>Tech</category>"));
        assert!(xml.contains("type=\"image/png\""));
        assert!(xml.contains("<language>en-US</language>"));
    }

    #[test]
    fn test_only_build_date_varies() {
        let a = render(
            &channel(),
            &[item()],
            Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let b = render(
            &channel(),
            &[item()],
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.contains("lastBuildDate"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_ne!(a, b);
        assert_eq!(strip(&a), strip(&b));
    }

    #[test]
    fn test_image_mime_guess() {
        assert_eq!(image_mime("https://e.com/a.webp?w=200"), "image/webp");
        assert_eq!(image_mime("https://e.com/photo"), "image/jpeg");
    }
}
