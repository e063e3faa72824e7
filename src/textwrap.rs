/// Width assumed per character when the font cannot measure.
pub const FALLBACK_CHAR_WIDTH: f32 = 10.0;

/// Greedy word wrap against a pixel budget. `measure` returns the rendered
/// width of a candidate line, or `None` when measuring is unavailable, in
/// which case a character-count estimate is used instead.
pub fn wrap_to_width<F>(text: &str, max_width: f32, measure: F) -> Vec<String>
where
    F: Fn(&str) -> Option<f32>,
{
    let width_of = |s: &str| measure(s).unwrap_or_else(|| s.chars().count() as f32 * FALLBACK_CHAR_WIDTH);

    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if width_of(&candidate) <= max_width || current.is_empty() {
            current = candidate;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
