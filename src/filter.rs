use crate::dom::{ContentTree, NodeId};

const EXCLUDED_TAGS: [&str; 4] = ["script", "style", "noscript", "iframe"];

/// Elements whose text may be matched or picked: not a non-content tag and
/// not user-editable.
pub fn is_eligible<T: ContentTree + ?Sized>(tree: &T, node: NodeId) -> bool {
    let Some(el) = tree.element(node) else {
        return false;
    };
    if EXCLUDED_TAGS.contains(&el.tag.as_str()) {
        return false;
    }
    !is_editable(tree, node)
}

/// `isContentEditable`: the nearest `contenteditable` attribute on the
/// element or an ancestor decides.
pub fn is_editable<T: ContentTree + ?Sized>(tree: &T, node: NodeId) -> bool {
    let mut current = Some(node);
    while let Some(id) = current {
        if let Some(value) = tree.element(id).and_then(|el| el.attr("contenteditable")) {
            return matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "" | "true" | "plaintext-only"
            );
        }
        current = tree.parent_element(id);
    }
    false
}

/// Fails open: any style or geometry error counts as visible.
pub fn is_visible<T: ContentTree + ?Sized>(tree: &T, node: NodeId) -> bool {
    let style = match tree.computed_style(node) {
        Ok(style) => style,
        Err(_) => return true,
    };
    if style.display_none || style.visibility_hidden || style.opacity <= 0.0 {
        return false;
    }
    match tree.bounding_rect(node) {
        Ok(rect) => rect.has_area(),
        Err(_) => true,
    }
}
