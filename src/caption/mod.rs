mod openai;

pub use openai::{DEFAULT_API_BASE, OpenAiCaptioner};

use anyhow::Result;

use crate::metadata::PhotoContext;

/// Instruction sent with every photo.
pub const BASE_PROMPT: &str = "Write a concise caption for this photo. Describe the main subject, the setting and any notable details in one or two sentences, using words someone would type when searching for this photo later. Only describe what is clearly visible; do not guess at names, places, dates or events that the image does not show.";

/// Trait for vision models that caption photos.
///
/// [`OpenAiCaptioner`] is the shipped implementation; tests and alternative
/// backends implement this directly.
///
/// # Example
///
/// ```rust,no_run
/// use photo_captioner::caption::{CaptionService, OpenAiCaptioner, BASE_PROMPT};
///
/// # async fn example() -> anyhow::Result<()> {
/// let service = OpenAiCaptioner::new("sk-...".into(), "gpt-4o".into());
/// let caption = service.caption("base64data", "image/jpeg", BASE_PROMPT).await?;
/// println!("{caption}");
/// # Ok(())
/// # }
/// ```
#[async_trait::async_trait]
pub trait CaptionService: Send + Sync {
    /// The display name of this service (e.g., "OpenAI").
    fn name(&self) -> &str;
    /// Caption a base64-encoded image. Returns the trimmed caption text.
    ///
    /// * `image_base64`: The image bytes encoded as base64
    /// * `mime_type`: The MIME type of the image (e.g., `"image/jpeg"`)
    /// * `prompt`: The instruction, usually from [`build_prompt`]
    async fn caption(&self, image_base64: &str, mime_type: &str, prompt: &str) -> Result<String>;
}

/// Build the instruction for a photo, adding any caption or keywords it
/// already carries.
///
/// With no existing context the result is exactly [`BASE_PROMPT`].
pub fn build_prompt(context: &PhotoContext) -> String {
    if context.is_empty() {
        return BASE_PROMPT.to_string();
    }

    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\nThis photo already has the following metadata:");
    if let Some(ref caption) = context.caption {
        prompt.push_str(&format!("\nExisting caption: {caption}"));
    }
    if !context.keywords.is_empty() {
        prompt.push_str(&format!("\nKeywords: {}", context.keywords.join(", ")));
    }
    prompt.push_str(
        "\n\nWhen this metadata names specific people, places, landmarks or events that fit the photo, \
         use those names in the caption instead of generic descriptions. \
         Do not infer anything beyond what the metadata and the image support.",
    );
    prompt
}

/// Pull the caption text out of a model reply. Fails if there is none.
pub(crate) fn clean_caption(content: Option<&str>) -> Result<String> {
    let caption = content.map(str::trim).unwrap_or_default();
    // Models sometimes wrap the whole caption in quotes
    let caption = caption
        .strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(caption)
        .trim();
    if caption.is_empty() {
        anyhow::bail!("Model returned no caption");
    }
    Ok(caption.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── build_prompt ─────────────────────────────────────────────────

    #[test]
    fn empty_context_gives_base_prompt() {
        assert_eq!(build_prompt(&PhotoContext::default()), BASE_PROMPT);
    }

    #[test]
    fn caption_context_appended() {
        let context = PhotoContext {
            caption: Some("Grandma's 80th birthday in Lisbon".into()),
            keywords: vec![],
        };
        let prompt = build_prompt(&context);
        assert!(prompt.starts_with(BASE_PROMPT));
        assert!(prompt.contains("Existing caption: Grandma's 80th birthday in Lisbon"));
        assert!(!prompt.contains("Keywords:"));
        assert!(prompt.contains("names"));
        assert!(prompt.contains("Do not infer"));
    }

    #[test]
    fn keyword_context_appended() {
        let context = PhotoContext {
            caption: None,
            keywords: vec!["Yosemite".into(), "Half Dome".into()],
        };
        let prompt = build_prompt(&context);
        assert!(prompt.starts_with(BASE_PROMPT));
        assert!(prompt.contains("Keywords: Yosemite, Half Dome"));
        assert!(!prompt.contains("Existing caption"));
    }

    #[test]
    fn base_prompt_asks_for_concise_unspeculative_caption() {
        assert!(BASE_PROMPT.contains("concise"));
        assert!(BASE_PROMPT.contains("searching"));
        assert!(BASE_PROMPT.contains("do not guess"));
    }

    // ── clean_caption ────────────────────────────────────────────────

    #[test]
    fn clean_caption_trims() {
        assert_eq!(clean_caption(Some("  A red kite.\n")).unwrap(), "A red kite.");
    }

    #[test]
    fn clean_caption_strips_wrapping_quotes() {
        assert_eq!(clean_caption(Some("\"A red kite.\"")).unwrap(), "A red kite.");
        assert_eq!(
            clean_caption(Some("The \"Blue\" bridge")).unwrap(),
            "The \"Blue\" bridge"
        );
    }

    #[test]
    fn clean_caption_rejects_empty() {
        assert!(clean_caption(None).is_err());
        assert!(clean_caption(Some("")).is_err());
        assert!(clean_caption(Some("   \n")).is_err());
        assert!(clean_caption(Some("\"\"")).is_err());
    }
}
