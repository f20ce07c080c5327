//! Prompts for vision-model transcription.

/// System prompt asking for a faithful plain-text transcription.
pub const TRANSCRIBE_PROMPT: &str = r#"You are an OCR engine. Transcribe all text visible in the page image.

Rules:
- Preserve the reading order a human would follow
- Keep line breaks between lines and a blank line between paragraphs
- Reproduce text exactly; do not correct spelling or wording
- Do not describe images, layout or formatting
- Do not add commentary, headings or markdown
- If the page has no text, output nothing"#;

/// Language hint appended as a second system message.
pub fn language_hint(language: &str) -> String {
    format!("The page is most likely written in the language with ISO 639-2 code '{language}'.")
}
