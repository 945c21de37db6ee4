//! Word-level diff between two text units.
//!
//! Text is split into word runs, whitespace runs and single punctuation or
//! CJK characters. The alignment keeps the set of common tokens with the
//! largest total character count, so the unchanged character count (and
//! therefore [`similarity`]) does not depend on argument order.

pub const MARK_OPEN: &str = "<b>";
pub const MARK_CLOSE: &str = "</b>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    Removed,
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSegment {
    pub kind: ChangeKind,
    pub value: String,
}

/// Result of diffing two units.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    /// Unchanged characters / longer unit's characters.
    pub similarity: f64,
    /// First text with unchanged spans wrapped in markers.
    pub annotated_a: String,
    /// Second text with unchanged spans wrapped in markers.
    pub annotated_b: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Space,
    Word,
    Single,
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xAC00..=0xD7AF
        | 0xF900..=0xFAFF
        | 0x20000..=0x2A6DF)
}

fn classify(c: char) -> TokenClass {
    if c.is_whitespace() {
        TokenClass::Space
    } else if (c.is_alphanumeric() || c == '_') && !is_cjk(c) {
        TokenClass::Word
    } else {
        TokenClass::Single
    }
}

/// Split `text` into diff tokens.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut current: Option<TokenClass> = None;

    for (idx, c) in text.char_indices() {
        let class = classify(c);
        match current {
            Some(prev) if prev == class && class != TokenClass::Single => {}
            Some(_) => {
                tokens.push(&text[start..idx]);
                start = idx;
            }
            None => start = idx,
        }
        current = Some(class);
    }
    if current.is_some() {
        tokens.push(&text[start..]);
    }
    tokens
}

/// Align `a` against `b` token by token.
pub fn diff_words(a: &str, b: &str) -> Vec<DiffSegment> {
    let ta = tokenize(a);
    let tb = tokenize(b);

    let prefix = ta.iter().zip(&tb).take_while(|(x, y)| x == y).count();
    let suffix = ta[prefix..]
        .iter()
        .rev()
        .zip(tb[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &ta[prefix..ta.len() - suffix];
    let mid_b = &tb[prefix..tb.len() - suffix];

    let mut segments = Vec::new();
    for token in &ta[..prefix] {
        push_segment(&mut segments, ChangeKind::Unchanged, token);
    }
    align_middle(mid_a, mid_b, &mut segments);
    for token in &ta[ta.len() - suffix..] {
        push_segment(&mut segments, ChangeKind::Unchanged, token);
    }
    segments
}

fn align_middle(ta: &[&str], tb: &[&str], segments: &mut Vec<DiffSegment>) {
    let (n, m) = (ta.len(), tb.len());
    let width = m + 1;
    // best[i * width + j]: heaviest common subsequence of ta[i..] and tb[j..]
    let mut best = vec![0usize; (n + 1) * width];

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            let skip = best[(i + 1) * width + j].max(best[i * width + j + 1]);
            best[i * width + j] = if ta[i] == tb[j] {
                skip.max(ta[i].chars().count() + best[(i + 1) * width + j + 1])
            } else {
                skip
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        let here = best[i * width + j];
        if ta[i] == tb[j] && here == ta[i].chars().count() + best[(i + 1) * width + j + 1] {
            push_segment(segments, ChangeKind::Unchanged, ta[i]);
            i += 1;
            j += 1;
        } else if best[(i + 1) * width + j] >= best[i * width + j + 1] {
            push_segment(segments, ChangeKind::Removed, ta[i]);
            i += 1;
        } else {
            push_segment(segments, ChangeKind::Added, tb[j]);
            j += 1;
        }
    }
    for token in &ta[i..] {
        push_segment(segments, ChangeKind::Removed, token);
    }
    for token in &tb[j..] {
        push_segment(segments, ChangeKind::Added, token);
    }
}

fn push_segment(segments: &mut Vec<DiffSegment>, kind: ChangeKind, token: &str) {
    match segments.last_mut() {
        Some(last) if last.kind == kind => last.value.push_str(token),
        _ => segments.push(DiffSegment {
            kind,
            value: token.to_string(),
        }),
    }
}

/// Diff similarity of two texts in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    compare(a, b).similarity
}

/// Diff `a` and `b`, score them and mark their shared spans.
pub fn compare(a: &str, b: &str) -> DiffOutcome {
    let longest = a.chars().count().max(b.chars().count());
    let mut unchanged = 0;
    let mut annotated_a = String::with_capacity(a.len());
    let mut annotated_b = String::with_capacity(b.len());

    for segment in diff_words(a, b) {
        match segment.kind {
            ChangeKind::Removed => annotated_a.push_str(&segment.value),
            ChangeKind::Added => annotated_b.push_str(&segment.value),
            ChangeKind::Unchanged => {
                unchanged += segment.value.chars().count();
                for side in [&mut annotated_a, &mut annotated_b] {
                    side.push_str(MARK_OPEN);
                    side.push_str(&segment.value);
                    side.push_str(MARK_CLOSE);
                }
            }
        }
    }

    // Spans separated only by the other side's insertions become adjacent.
    let joint = format!("{}{}", MARK_CLOSE, MARK_OPEN);
    let similarity = if longest == 0 {
        0.0
    } else {
        unchanged as f64 / longest as f64
    };

    DiffOutcome {
        similarity,
        annotated_a: annotated_a.replace(&joint, ""),
        annotated_b: annotated_b.replace(&joint, ""),
    }
}
