//! Detection of pragmas that need special connection routing

/// Classification of an outgoing SQL string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PragmaKind {
   /// Ordinary SQL, routed by the usual reader/writer rules.
   None,
   /// `PRAGMA journal_mode = ...`; must go through the pool's journal mode transition.
   SetJournalMode,
   /// `PRAGMA foreign_keys`, read or write; pinned to the writer.
   ForeignKeys,
   /// `PRAGMA synchronous`, read or write; pinned to the writer.
   Synchronous,
}

/// Classifies `sql` without allocating.
///
/// Anything that is not a letter is skipped between `PRAGMA` and the pragma
/// name, Unicode included.
///
/// Leading whitespace, `--` line comments and `/* */` block comments are
/// skipped. Block comments end at the first `*/` (nesting is not honored).
/// A bare `PRAGMA journal_mode` is a read and classifies as [`PragmaKind::None`].
pub fn classify(sql: &str) -> PragmaKind {
   let bytes = sql.as_bytes();
   let Some(start) = statement_start(bytes) else {
      return PragmaKind::None;
   };

   if bytes.len() - start < 6 || !bytes[start..start + 3].eq_ignore_ascii_case(b"PRA") {
      return PragmaKind::None;
   }

   // Six characters in, then on to the first letter of the pragma name
   let after_keyword = sql[start..]
      .char_indices()
      .nth(6)
      .map_or("", |(offset, _)| &sql[start + offset..]);
   let rest = after_keyword
      .trim_start_matches(|c: char| !c.is_alphabetic())
      .as_bytes();

   if starts_with_ignore_case(rest, b"journal_mode") {
      if rest[b"journal_mode".len()..].contains(&b'=') {
         PragmaKind::SetJournalMode
      } else {
         PragmaKind::None
      }
   } else if starts_with_ignore_case(rest, b"foreign_keys") {
      PragmaKind::ForeignKeys
   } else if starts_with_ignore_case(rest, b"synchronous") {
      PragmaKind::Synchronous
   } else {
      PragmaKind::None
   }
}

fn starts_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
   haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

/// Index of the first byte past whitespace and comments, or `None` when fewer
/// than three bytes of statement remain or a comment is unterminated.
fn statement_start(s: &[u8]) -> Option<usize> {
   let limit = s.len().checked_sub(2)?;
   let mut i = 0;

   while i < limit {
      match s[i] {
         c if c <= b' ' => i += 1,
         b'-' => {
            if s[i + 1] != b'-' {
               return Some(i);
            }
            let newline = s[i + 2..].iter().position(|&c| c == b'\n')?;
            i = i + 2 + newline + 1;
         }
         b'/' => {
            if s[i + 1] != b'*' {
               return Some(i);
            }
            let close = s[i + 2..].windows(2).position(|w| w == b"*/")?;
            i = i + 2 + close + 2;
         }
         _ => return Some(i),
      }
   }

   None
}
