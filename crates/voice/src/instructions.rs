/// Spoken-output rules appended to every agent's voice instructions.
const VOICE_FORMATTING_RULES: &str = "\
You are speaking, not writing. Follow these rules in every reply:
- Never use markdown, bullet points, tables, emoji or code blocks.
- Spell out digits one by one when reading codes, phone numbers or identifiers.
- Read URLs and email addresses aloud in words, for example \"example dot com\".
- Say numbers, dates and times the way a person would in conversation, for \
example \"twenty past three\" or \"March fifth\".
- Keep answers short and ask a follow-up question when something is unclear.";

/// Response trigger sent right after the session is configured.
pub const INTRODUCTION_PROMPT: &str =
    "Greet the caller and briefly introduce yourself and what you can help with.";

/// Session instructions for an agent speaking through the voice relay.
pub fn voice_instructions(name: &str, description: Option<&str>) -> String {
    let mut out = format!("You are {name}, a voice assistant.");
    if let Some(desc) = description.map(str::trim).filter(|d| !d.is_empty()) {
        out.push_str("\n\n");
        out.push_str(desc);
    }
    out.push_str("\n\n");
    out.push_str(VOICE_FORMATTING_RULES);
    out
}
