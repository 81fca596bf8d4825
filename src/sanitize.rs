/// Characters stripped from submitted text.
pub const STRIPPED_CHARS: [char; 4] = ['<', '>', '"', '\''];

/// Removes [`STRIPPED_CHARS`] wherever they occur and trims surrounding whitespace.
///
/// This is a blunt filter, not context-aware escaping: it does not make text safe
/// to embed in HTML attributes, scripts, or URLs. Callers rendering the result must
/// escape it themselves.
#[must_use]
pub fn sanitize(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect();
    stripped.trim().to_owned()
}
