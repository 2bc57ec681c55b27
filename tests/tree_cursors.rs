use pagetree::Tree;

fn filled(n: u64) -> Tree {
    let mut tree = Tree::new().unwrap();
    for key in 1..=n {
        tree.insert(key, key).unwrap();
    }
    tree
}

#[test]
fn scan_visits_every_record_once_in_order() {
    // 300 records span a leaf boundary.
    let tree = filled(300);

    let mut cursor = tree.cursor();
    let mut visited = Vec::new();
    while let Some((key, value)) = cursor.get() {
        assert_eq!(value, key);
        visited.push(key);
        cursor.advance();
    }
    assert_eq!(visited, (1..=300).collect::<Vec<_>>());
    assert!(!cursor.advance(), "past the end the cursor stays put");
}

#[test]
fn cursor_on_empty_tree_reads_nothing() {
    let tree = Tree::new().unwrap();
    let mut cursor = tree.cursor();
    assert_eq!(cursor.get(), None);
    assert!(!cursor.advance());
}

#[test]
fn seek_lands_on_first_key_not_less() {
    let mut tree = Tree::new().unwrap();
    for key in (10..=100).step_by(10) {
        tree.insert(key, key).unwrap();
    }

    assert_eq!(tree.cursor_at(30).get(), Some((30, 30)));
    assert_eq!(tree.cursor_at(31).get(), Some((40, 40)));
    assert_eq!(tree.cursor_at(1).get(), Some((10, 10)));

    // Past every key: nothing now, nothing after a step either.
    let mut cursor = tree.cursor_at(101);
    assert_eq!(cursor.get(), None);
    assert!(!cursor.advance());
}

#[test]
fn deleted_record_invalidates_then_advances() {
    let mut tree = filled(300);

    let mut cursor = tree.cursor();
    assert_eq!(cursor.get(), Some((1, 1)));

    tree.remove(1).unwrap();
    assert_eq!(cursor.get(), None);
    assert!(cursor.advance());
    assert_eq!(cursor.get(), Some((2, 2)));
}

#[test]
fn reinserted_key_comes_back_under_the_cursor() {
    let mut tree = filled(10);
    let mut cursor = tree.cursor_at(5);
    assert_eq!(cursor.get(), Some((5, 5)));

    tree.remove(5).unwrap();
    tree.insert(5, 555).unwrap();

    assert_eq!(cursor.get(), None, "deletion still shows until the cursor moves");
    assert!(cursor.advance());
    assert_eq!(cursor.get(), Some((5, 555)));
}

#[test]
fn update_through_the_cursor() {
    let mut tree = filled(10);
    let cursor = tree.cursor_at(7);
    assert!(cursor.update(700));
    assert_eq!(tree.get(7), Some(700));
    assert_eq!(cursor.get(), Some((7, 700)));

    tree.remove(7).unwrap();
    assert!(!cursor.update(7000), "a deleted record cannot be updated");

    let past_end = tree.cursor_at(u64::MAX);
    assert!(!past_end.update(1));
}

#[test]
fn cursor_survives_a_split() {
    let mut tree = filled(255);
    let mut cursor = tree.cursor();
    for _ in 0..100 {
        cursor.advance();
    }
    assert_eq!(cursor.get(), Some((101, 101)));

    // Overflow the root leaf; the cursor's record stays under it.
    tree.insert(1000, 1000).unwrap();
    assert_eq!(cursor.get(), Some((101, 101)));

    let mut rest = Vec::new();
    while let Some((key, _)) = cursor.get() {
        rest.push(key);
        cursor.advance();
    }
    let expected: Vec<u64> = (101..=255).chain([1000]).collect();
    assert_eq!(rest, expected);
}

#[test]
fn cursor_survives_rotation_between_leaves() {
    let mut tree = filled(300);

    // Key 129 opens the second leaf; deleting key 1 makes the first leaf
    // borrow it back, dragging the cursor across with it.
    let mut cursor = tree.cursor_at(129);
    assert_eq!(cursor.get(), Some((129, 129)));

    tree.remove(1).unwrap();
    assert_eq!(cursor.get(), Some((129, 129)));
    assert!(cursor.advance());
    assert_eq!(cursor.get(), Some((130, 130)));
}

#[test]
fn cursor_survives_a_leaf_merge() {
    let mut tree = filled(300);
    let mut cursor = tree.cursor_at(200);
    assert_eq!(cursor.get(), Some((200, 200)));

    // Drain the right leaf until it merges into the left one.
    for key in (255..=299).rev() {
        tree.remove(key).unwrap();
    }
    assert_eq!(tree.stats().blocks, 1, "the leaves should have merged");
    assert_eq!(cursor.get(), Some((200, 200)));

    let mut rest = Vec::new();
    while let Some((key, _)) = cursor.get() {
        rest.push(key);
        cursor.advance();
    }
    let expected: Vec<u64> = (200..=254).chain([300]).collect();
    assert_eq!(rest, expected);
}

#[test]
fn iterating_while_everything_ahead_disappears() {
    let mut tree = filled(100);
    let mut cursor = tree.cursor_at(50);
    for key in 51..=100 {
        tree.remove(key).unwrap();
    }
    assert_eq!(cursor.get(), Some((50, 50)));
    assert!(!cursor.advance(), "nothing is left past the cursor");
    assert_eq!(cursor.get(), None);
}

#[test]
fn dropped_tree_quiets_its_cursors() {
    let tree = filled(10);
    let mut cursor = tree.cursor();
    assert!(cursor.tree().is_some());
    assert_eq!(cursor.get(), Some((1, 1)));

    drop(tree);
    assert!(cursor.tree().is_none());
    assert_eq!(cursor.get(), None);
    assert!(!cursor.advance());
    assert!(!cursor.update(9));
}

#[test]
fn tree_handle_recovered_from_a_cursor() {
    let tree = filled(3);
    let cursor = tree.cursor();
    let mut again = cursor.tree().unwrap();
    again.insert(4, 40).unwrap();
    assert_eq!(tree.get(4), Some(40));
}

#[test]
fn stats_track_open_cursors() {
    let tree = filled(5);
    assert_eq!(tree.stats().cursors, 0);

    let a = tree.cursor();
    let b = tree.cursor_at(3);
    assert_eq!(tree.stats().cursors, 2);

    drop(a);
    assert_eq!(tree.stats().cursors, 1);
    drop(b);
    assert_eq!(tree.stats().cursors, 0);
}
