//! Activity <-> CloudEvent conversion
//!
//! Inbound: a remote activity plus its actor become one normalized event.
//! Outbound: an internal event becomes a public Note from an interest actor.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;

use super::CloudEvent;
use crate::error::AppError;
use crate::federation::vocab::{Activity, Actor, Object, builder, first_link, parse_time};

pub const EVENT_TYPE: &str = "com.awakari.activitypub.v1";

const BLOCK_CLOSERS: [&str; 13] = [
    "<br", "</p>", "</div>", "</li>", "</blockquote>", "</pre>", "</h1>", "</h2>", "</h3>",
    "</h4>", "</h5>", "</h6>", "</tr>",
];

// Attribute names
pub const ATTR_ACTION: &str = "action";
pub const ATTR_AUTHOR: &str = "author";
pub const ATTR_TIME: &str = "time";
pub const ATTR_SUBJECT: &str = "subject";
pub const ATTR_ATTACHMENT: &str = "attachment";
pub const ATTR_SUMMARY: &str = "summary";
pub const ATTR_IMAGE: &str = "image";
pub const ATTR_LATITUDE: &str = "latitude";
pub const ATTR_LONGITUDE: &str = "longitude";
pub const ATTR_TITLE: &str = "title";
pub const ATTR_OBJECT: &str = "object";
pub const ATTR_OBJECT_URL: &str = "objecturl";

/// Convert a remote activity into a normalized event.
///
/// Returns `Ok(None)` for activities that are dropped by policy: self
/// deletes, sensitive objects and non-public addressing.
///
/// # Errors
/// `AppError::NoBot` when the activity or its object carries `#nobot`
pub fn activity_to_event(actor: &Actor, activity: &Activity) -> Result<Option<CloudEvent>, AppError> {
    if activity.has_nobot() {
        return Err(AppError::NoBot);
    }
    if activity.is_self_delete() {
        return Ok(None);
    }
    let object = activity.embedded_object();
    if object.is_some_and(Object::is_sensitive) {
        return Ok(None);
    }
    if !activity.is_public() {
        return Ok(None);
    }

    let source = match activity.actor_id() {
        "" => actor.id.as_str(),
        id => id,
    };
    let mut event = CloudEvent::new(uuid::Uuid::new_v4().to_string(), source, EVENT_TYPE);
    event.set_attr(ATTR_ACTION, activity.kind.as_str());
    event.set_attr(ATTR_AUTHOR, author_link(actor));

    let time = activity
        .published_at()
        .or_else(|| object.and_then(|o| o.published.as_deref()).and_then(parse_time))
        .unwrap_or_else(Utc::now);
    event.set_attr(ATTR_TIME, time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

    match object {
        Some(obj) => {
            apply_object(&mut event, obj);
        }
        None => {
            let object_id = activity.object_id();
            if !object_id.is_empty() {
                event.set_attr(ATTR_OBJECT, object_id);
                event.set_attr(ATTR_OBJECT_URL, object_id);
            }
        }
    }

    Ok(Some(event))
}

fn apply_object(event: &mut CloudEvent, obj: &Object) {
    if !obj.kind.is_empty() {
        event.set_attr(ATTR_SUBJECT, obj.kind.as_str());
    }
    if !obj.id.is_empty() {
        event.set_attr(ATTR_OBJECT, obj.id.as_str());
    }
    let url = obj
        .url
        .as_ref()
        .and_then(first_link)
        .or_else(|| (!obj.id.is_empty()).then(|| obj.id.clone()));
    if let Some(url) = url {
        event.set_attr(ATTR_OBJECT_URL, url);
    }
    if let Some(attachment) = obj.attachment.iter().find_map(first_link) {
        event.set_attr(ATTR_ATTACHMENT, attachment);
    }
    if let Some(summary) = obj.summary.as_deref().map(html_to_text).filter(|s| !s.is_empty()) {
        event.set_attr(ATTR_SUMMARY, summary);
    }
    if let Some(title) = obj.name.as_deref().map(html_to_text).filter(|s| !s.is_empty()) {
        event.set_attr(ATTR_TITLE, title);
    }
    if let Some(image) = obj.image.as_ref().and_then(first_link) {
        event.set_attr(ATTR_IMAGE, image);
    }
    if let Some(place) = obj
        .location
        .iter()
        .find(|p| p.latitude.is_some() && p.longitude.is_some())
    {
        if let (Some(lat), Some(lon)) = (place.latitude, place.longitude) {
            event.set_attr(ATTR_LATITUDE, lat);
            event.set_attr(ATTR_LONGITUDE, lon);
        }
    }

    if let Some(content) = obj.content.as_deref() {
        let text = html_to_text(content);
        if !text.is_empty() {
            event.datacontenttype = Some("text/plain".to_string());
            event.data = Some(Value::String(text));
        }
    }
}

/// `<a href="{actor id}">{plain name}</a>`
pub fn author_link(actor: &Actor) -> String {
    let name = strip_tags(actor.display_name());
    format!(
        "<a href=\"{}\">{}</a>",
        html_escape::encode_double_quoted_attribute(&actor.id),
        html_escape::encode_text(name.trim())
    )
}

fn strip_tags(html: &str) -> String {
    let cleaned = ammonia::Builder::empty()
        .clean_content_tags(HashSet::from(["script", "style"]))
        .clean(html)
        .to_string();
    html_escape::decode_html_entities(&cleaned).into_owned()
}

/// Plain text of an HTML fragment: tags stripped, entities decoded,
/// non-printable code points dropped, whitespace collapsed, lower-cased.
pub fn html_to_text(html: &str) -> String {
    let mut spaced = html.to_string();
    for closer in BLOCK_CLOSERS {
        spaced = spaced.replace(closer, &format!(" {}", closer));
    }

    let text = strip_tags(&spaced);
    let printable: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !c.is_control() && !is_invisible(*c))
        .collect();

    printable
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}')
}

/// Map an internal event to a `Create{Note}` from an interest actor.
///
/// # Arguments
/// * `event` - Internal event
/// * `actor` - Interest actor IRI
/// * `followers` - Followers collection IRI of that actor
pub fn event_to_activity(event: &CloudEvent, actor: &str, followers: &str) -> Value {
    let url = match event.attr_str(ATTR_OBJECT_URL) {
        "" => event.source.as_str(),
        u => u,
    };
    let title = event.attr_str(ATTR_TITLE);
    let summary = event.attr_str(ATTR_SUMMARY);
    let text = event.text();

    let mut content = String::new();
    for part in [title, summary, text.as_str()] {
        if !part.is_empty() {
            content.push_str(&format!("<p>{}</p>", html_escape::encode_text(part)));
        }
    }
    content.push_str(&format!(
        "<p><a href=\"{}\">{}</a></p>",
        html_escape::encode_double_quoted_attribute(url),
        html_escape::encode_text(url)
    ));

    let published = match event.attr_str(ATTR_TIME) {
        "" => Utc::now().to_rfc3339(),
        t => t.to_string(),
    };
    let note_id = format!("{}/events/{}", actor, urlencoding::encode(&event.id));
    let note = builder::note(
        &note_id,
        actor,
        &content,
        url,
        &published,
        followers,
        (!title.is_empty()).then_some(title),
    );
    builder::create(&format!("{}/activity", note_id), actor, note, followers)
}
