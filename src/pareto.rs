use std::collections::HashMap;

use crate::models::Transaction;

/// Uncategorized transactions sharing one canonical description.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityGroup {
    pub canonical_description: String,
    pub count: usize,
    /// Earliest transaction of the group (by date, then id).
    pub representative: Transaction,
}

/// Group by canonical description, most frequent first, ties by key.
pub fn prioritize(transactions: &[Transaction]) -> Vec<PriorityGroup> {
    let mut groups: HashMap<&str, (usize, &Transaction)> = HashMap::new();
    for txn in transactions {
        groups
            .entry(txn.canonical_description.as_str())
            .and_modify(|(count, rep)| {
                *count += 1;
                if (txn.transaction_date, txn.id) < (rep.transaction_date, rep.id) {
                    *rep = txn;
                }
            })
            .or_insert((1, txn));
    }

    let mut out: Vec<PriorityGroup> = groups
        .into_iter()
        .map(|(key, (count, rep))| PriorityGroup {
            canonical_description: key.to_string(),
            count,
            representative: rep.clone(),
        })
        .collect();
    out.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.canonical_description.cmp(&b.canonical_description))
    });
    out
}
