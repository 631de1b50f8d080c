// Selection rule applied on every contact-set notification

use crate::models::User;

/// Pick the contact that should be selected after the contact list changed.
///
/// The previous selection survives if it is still listed (with its refreshed
/// profile); otherwise the first contact is chosen; an empty list selects
/// nobody.
pub fn reconcile_selection(previous: Option<&str>, contacts: &[User]) -> Option<User> {
    previous
        .and_then(|id| contacts.iter().find(|user| user.id == id))
        .or_else(|| contacts.first())
        .cloned()
}
