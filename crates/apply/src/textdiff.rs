//! Line-based unified diff (`---`/`+++`/`@@` hunks). Common leading and trailing
//! lines are matched directly; only the differing middle is aligned by LCS.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Equal,
    Delete,
    Insert,
}

#[derive(Debug, Clone, Copy)]
struct Op {
    tag: Tag,
    /// Position in the old text (for inserts: the line it precedes).
    a: usize,
    /// Position in the new text (for deletes: the line it precedes).
    b: usize,
}

/// Largest LCS table (cells) for the differing middle; beyond it the middle is
/// emitted as one delete run followed by one insert run.
const MAX_TABLE_CELLS: usize = 4_000_000;

fn align(old: &[&str], new: &[&str]) -> Vec<Op> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..].iter().rev().zip(new[prefix..].iter().rev()).take_while(|(a, b)| a == b).count();
    let (n, m) = (old.len(), new.len());

    let mut ops = Vec::with_capacity(n + m);
    ops.extend((0..prefix).map(|k| Op { tag: Tag::Equal, a: k, b: k }));
    align_middle(&old[prefix..n - suffix], &new[prefix..m - suffix], prefix, prefix, &mut ops);
    ops.extend((0..suffix).map(|k| Op { tag: Tag::Equal, a: n - suffix + k, b: m - suffix + k }));

    // Emit deletions before insertions within a change run, like diff(1).
    let mut k = 0;
    while k < ops.len() {
        if ops[k].tag == Tag::Equal {
            k += 1;
            continue;
        }
        let start = k;
        while k < ops.len() && ops[k].tag != Tag::Equal {
            k += 1;
        }
        ops[start..k].sort_by_key(|op| if op.tag == Tag::Delete { 0 } else { 1 });
    }
    ops
}

fn align_middle(old: &[&str], new: &[&str], a0: usize, b0: usize, ops: &mut Vec<Op>) {
    let (n, m) = (old.len(), new.len());
    if (n + 1).saturating_mul(m + 1) > MAX_TABLE_CELLS {
        ops.extend((0..n).map(|i| Op { tag: Tag::Delete, a: a0 + i, b: b0 }));
        ops.extend((0..m).map(|j| Op { tag: Tag::Insert, a: a0 + n, b: b0 + j }));
        return;
    }
    // lcs[i * w + j] = LCS length of old[i..] and new[j..]
    let w = m + 1;
    let mut lcs = vec![0u32; (n + 1) * w];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * w + j] = if old[i] == new[j] { lcs[(i + 1) * w + j + 1] + 1 } else { lcs[(i + 1) * w + j].max(lcs[i * w + j + 1]) };
        }
    }
    let (mut i, mut j) = (0usize, 0usize);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            ops.push(Op { tag: Tag::Equal, a: a0 + i, b: b0 + j });
            i += 1;
            j += 1;
        } else if j < m && (i == n || lcs[i * w + j + 1] >= lcs[(i + 1) * w + j]) {
            ops.push(Op { tag: Tag::Insert, a: a0 + i, b: b0 + j });
            j += 1;
        } else {
            ops.push(Op { tag: Tag::Delete, a: a0 + i, b: b0 + j });
            i += 1;
        }
    }
}

fn range(start: usize, len: usize) -> String {
    // 1-based; an empty range names the line before it.
    let first = if len == 0 { start } else { start + 1 };
    if len == 1 { first.to_string() } else { format!("{},{}", first, len) }
}

/// Unified diff of `old` vs `new`; empty when the texts are line-equal.
pub fn unified(old: &str, new: &str, old_label: &str, new_label: &str, context: usize) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let ops = align(&a, &b);

    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for (k, op) in ops.iter().enumerate() {
        if op.tag == Tag::Equal {
            continue;
        }
        let s = k.saturating_sub(context);
        let e = (k + 1 + context).min(ops.len());
        match hunks.last_mut() {
            Some(last) if s <= last.1 => last.1 = e,
            _ => hunks.push((s, e)),
        }
    }
    if hunks.is_empty() {
        return String::new();
    }

    let mut out = format!("--- {}\n+++ {}\n", old_label, new_label);
    for (s, e) in hunks {
        let slice = &ops[s..e];
        let old_len = slice.iter().filter(|op| op.tag != Tag::Insert).count();
        let new_len = slice.iter().filter(|op| op.tag != Tag::Delete).count();
        out.push_str(&format!("@@ -{} +{} @@\n", range(slice[0].a, old_len), range(slice[0].b, new_len)));
        for op in slice {
            match op.tag {
                Tag::Equal => out.push_str(&format!(" {}\n", a[op.a])),
                Tag::Delete => out.push_str(&format!("-{}\n", a[op.a])),
                Tag::Insert => out.push_str(&format!("+{}\n", b[op.b])),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_texts_have_no_diff() {
        assert_eq!(unified("a\nb\n", "a\nb\n", "x", "y", 3), "");
    }

    #[test]
    fn single_line_change_with_context() {
        let old = "a\nb\nc\nd\ne\n";
        let new = "a\nb\nC\nd\ne\n";
        let d = unified(old, new, "live", "merged", 1);
        assert_eq!(d, "--- live\n+++ merged\n@@ -2,3 +2,3 @@\n b\n-c\n+C\n d\n");
    }

    #[test]
    fn distant_changes_make_separate_hunks() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let new = "1x\n2\n3\n4\n5\n6\n7\n8\n9x\n";
        let d = unified(old, new, "a", "b", 1);
        let hunks: Vec<&str> = d.lines().filter(|l| l.starts_with("@@")).collect();
        assert_eq!(hunks, vec!["@@ -1,2 +1,2 @@", "@@ -8,2 +8,2 @@"]);
    }

    #[test]
    fn pure_insertion_into_empty() {
        let d = unified("", "a\nb\n", "a", "b", 3);
        assert_eq!(d, "--- a\n+++ b\n@@ -0,0 +1,2 @@\n+a\n+b\n");
    }

    #[test]
    fn deletions_precede_insertions() {
        let d = unified("k: 1\n", "k: 2\n", "a", "b", 0);
        assert_eq!(d, "--- a\n+++ b\n@@ -1 +1 @@\n-k: 1\n+k: 2\n");
    }

    #[test]
    fn large_input_with_one_change_stays_small() {
        let old: String = (0..50_000).map(|i| format!("  key-{}: value-{}\n", i, i)).collect();
        let new = old.replacen("  key-25000: value-25000\n", "  key-25000: changed\n", 1);
        let d = unified(&old, &new, "live", "merged", 1);
        assert_eq!(d, "--- live\n+++ merged\n@@ -25000,3 +25000,3 @@\n   key-24999: value-24999\n-  key-25000: value-25000\n+  key-25000: changed\n   key-25001: value-25001\n");
    }

    #[test]
    fn oversized_middle_falls_back_to_replace_run() {
        let old: String = (0..3000).map(|i| format!("a{}\n", i)).collect();
        let new: String = (0..3000).map(|i| format!("b{}\n", i)).collect();
        let d = unified(&old, &new, "x", "y", 0);
        assert!(d.starts_with("--- x\n+++ y\n@@ -1,3000 +1,3000 @@\n-a0\n"), "{}", &d[..40]);
        assert_eq!(d.lines().filter(|l| l.starts_with('-') && !l.starts_with("---")).count(), 3000);
        assert_eq!(d.lines().filter(|l| l.starts_with('+') && !l.starts_with("+++")).count(), 3000);
    }
}
