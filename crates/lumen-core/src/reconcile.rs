//! Reconciling the final text against what was already streamed.

/// The part of `final_text` not yet represented by `emitted`.
///
/// Precedence:
/// 1. nothing emitted: the whole final text;
/// 2. identical: nothing;
/// 3. final text extends the emitted text: the remainder;
/// 4. emitted text found inside the final text: what follows it; emitted
///    text already ending with the whole final text: nothing;
/// 5. no relation: the whole final text again.
///
/// This is a heuristic. When the incremental and final texts diverge the
/// last rule duplicates output rather than dropping it.
pub fn owed_suffix<'a>(emitted: &str, final_text: &'a str) -> &'a str {
    if emitted.is_empty() {
        return final_text;
    }
    if final_text == emitted {
        return "";
    }
    if let Some(rest) = final_text.strip_prefix(emitted) {
        return rest;
    }
    if let Some(index) = final_text.find(emitted) {
        return &final_text[index + emitted.len()..];
    }
    if emitted.ends_with(final_text) {
        return "";
    }
    final_text
}

/// Split `text` into natural chunks of at most `max_chars` characters.
///
/// Sentence ends (`.`, `!`, `?` followed by whitespace or the end, and line
/// breaks) are preferred; longer sentences are sliced on char boundaries.
/// The chunks always concatenate back to `text`.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    let mut chars = text.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        let boundary = match ch {
            '\n' => true,
            '.' | '!' | '?' => match chars.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace(),
            },
            _ => false,
        };
        if boundary {
            let end = index + ch.len_utf8();
            slice_into(&mut chunks, &text[start..end], max_chars);
            start = end;
        }
    }
    slice_into(&mut chunks, &text[start..], max_chars);
    chunks
}

fn slice_into<'a>(chunks: &mut Vec<&'a str>, mut piece: &'a str, max_chars: usize) {
    while let Some((split, _)) = piece.char_indices().nth(max_chars) {
        chunks.push(&piece[..split]);
        piece = &piece[split..];
    }
    if !piece.is_empty() {
        chunks.push(piece);
    }
}
