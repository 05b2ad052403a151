//! Tests for the managed-cell lifecycle and the cycle collector

use super::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Linked cell with an externally visible destruction counter.
struct Node {
    label: u32,
    next: RefCell<Option<Handle<Node>>>,
    drops: Rc<Cell<usize>>,
}

impl Node {
    fn new(heap: &Heap, label: u32, drops: &Rc<Cell<usize>>) -> Handle<Node> {
        heap.alloc(Node {
            label,
            next: RefCell::new(None),
            drops: Rc::clone(drops),
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

unsafe impl Trace for Node {
    fn trace(&self, tracer_fn: &mut TracerFn) {
        self.next.trace(tracer_fn);
    }
}

fn link(from: &Handle<Node>, to: &Handle<Node>) {
    *from.next.borrow_mut() = Some(to.clone());
}

mod handle_tests {
    use super::*;

    #[test]
    fn test_alloc_and_deref() {
        let heap = Heap::new();
        let value = heap.alloc(42u32);
        assert_eq!(*value, 42);
        assert_eq!(value.ref_count(), RefCount::Owned(1));
        assert_eq!(heap.stats().live_objects, 1);
        assert_eq!(heap.stats().objects_allocated, 1);
    }

    #[test]
    fn test_clone_retains() {
        let heap = Heap::new();
        let first = heap.alloc(String::from("shared"));
        let second = first.clone();
        assert_eq!(first.ref_count(), RefCount::Owned(2));
        assert!(first.ptr_eq(&second));
        assert_eq!(*second, "shared");
        drop(second);
        assert_eq!(first.ref_count(), RefCount::Owned(1));
    }

    #[test]
    fn test_get_mut_requires_unique_owner() {
        let heap = Heap::new();
        let mut value = heap.alloc(5u32);
        if let Some(payload) = value.get_mut() {
            *payload = 7;
        }
        let other = value.clone();
        assert!(value.get_mut().is_none());
        drop(other);
        assert!(value.get_mut().is_some());
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_into_raw_round_trip() {
        let heap = Heap::new();
        let value = heap.alloc(String::from("payload"));
        let raw = value.into_raw();
        assert_eq!(heap.stats().live_objects, 1);
        let restored = unsafe { Handle::<String>::from_raw(raw) };
        assert_eq!(*restored, "payload");
        assert_eq!(restored.ref_count(), RefCount::Owned(1));
        drop(restored);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn test_debug_formats_the_payload() {
        let heap = Heap::new();
        let value = heap.alloc(7u32);
        assert_eq!(format!("{value:?}"), "7");
    }

    #[test]
    fn test_final_release_destroys_immediately() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        // Count goes one to zero without a park in between.
        drop(node);
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.root_count(), 0);
    }
}

mod release_tests {
    use super::*;

    #[test]
    fn test_release_parks_a_candidate() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        drop(node.clone());
        assert_eq!(heap.root_count(), 1);
        assert_eq!(node.color(), Color::Purple);
        assert!(node.is_buffered());
        assert_eq!(drops.get(), 0);
        assert!(node.next.borrow().is_none());
    }

    #[test]
    fn test_repeated_release_parks_once() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        let first = node.clone();
        let second = node.clone();
        drop(first);
        drop(second);
        assert_eq!(heap.root_count(), 1);
        assert_eq!(node.ref_count(), RefCount::Owned(1));
    }

    #[test]
    fn test_retain_reblackens_a_candidate() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        drop(node.clone());
        assert_eq!(node.color(), Color::Purple);
        let revived = node.clone();
        assert_eq!(node.color(), Color::Black);
        assert!(node.is_buffered());
        let collected = heap.collect_cycles();
        assert_eq!(collected.total(), 0);
        assert_eq!(heap.root_count(), 0);
        assert!(!node.is_buffered());
        assert_eq!(drops.get(), 0);
        drop(revived);
    }

    #[test]
    fn test_buffered_corpse_frees_at_next_pass() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        drop(node.clone());
        assert_eq!(heap.root_count(), 1);
        // The destructor runs now; the block stays parked until a pass.
        drop(node);
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.root_count(), 1);
        let collected = heap.collect_cycles();
        assert_eq!(collected.acyclic, 1);
        assert_eq!(collected.cyclic, 0);
        assert_eq!(heap.root_count(), 0);
        assert_eq!(heap.stats().freed_acyclic, 1);
    }
}

mod immortal_tests {
    use super::*;

    #[test]
    fn test_immortal_ignores_counting() {
        let heap = Heap::new();
        let value = heap.alloc_immortal(7u32);
        assert!(value.is_immortal());
        assert_eq!(value.ref_count(), RefCount::Immortal);
        let copy = value.clone();
        assert_eq!(copy.ref_count(), RefCount::Immortal);
        drop(copy);
        drop(value);
        // Immortal cells are never destroyed.
        assert_eq!(heap.stats().live_objects, 1);
        assert_eq!(heap.root_count(), 0);
    }

    #[test]
    fn test_immortal_payload_keeps_children_alive() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let child = Node::new(&heap, 2, &drops);
        let immortal = heap.alloc_immortal(Node {
            label: 1,
            next: RefCell::new(Some(child.clone())),
            drops: Rc::clone(&drops),
        });
        drop(child);
        // One count survives inside the immortal payload, so the pass
        // re-blackens the child instead of collecting it.
        assert_eq!(heap.root_count(), 1);
        let collected = heap.collect_cycles();
        assert_eq!(collected.total(), 0);
        assert_eq!(drops.get(), 0);
        assert_eq!(immortal.next.borrow().as_ref().map(|n| n.label), Some(2));
    }

    #[test]
    fn test_pass_never_traces_through_immortals() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let immortal = heap.alloc_immortal(Node {
            label: 1,
            next: RefCell::new(None),
            drops: Rc::clone(&drops),
        });
        let parent = Node::new(&heap, 2, &drops);
        *parent.next.borrow_mut() = Some(immortal.clone());
        drop(parent.clone());
        assert_eq!(heap.root_count(), 1);
        let collected = heap.collect_cycles();
        assert_eq!(collected.total(), 0);
        assert_eq!(immortal.ref_count(), RefCount::Immortal);
        assert_eq!(parent.ref_count(), RefCount::Owned(1));
        assert_eq!(drops.get(), 0);
    }
}

mod cycles_tests {
    use super::*;

    #[test]
    fn test_self_cycle_is_collected() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        link(&node, &node);
        drop(node);
        assert_eq!(drops.get(), 0);
        assert_eq!(heap.root_count(), 1);
        let collected = heap.collect_cycles();
        assert_eq!(collected.cyclic, 1);
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.stats().collections_run, 1);
    }

    #[test]
    fn test_two_cycle_is_collected() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        {
            let first = Node::new(&heap, 1, &drops);
            let second = Node::new(&heap, 2, &drops);
            link(&first, &second);
            link(&second, &first);
        }
        assert_eq!(drops.get(), 0);
        let collected = heap.collect_cycles();
        assert_eq!(collected.cyclic, 2);
        assert_eq!(drops.get(), 2);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn test_three_cycle_is_collected() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        {
            let first = Node::new(&heap, 1, &drops);
            let second = Node::new(&heap, 2, &drops);
            let third = Node::new(&heap, 3, &drops);
            link(&first, &second);
            link(&second, &third);
            link(&third, &first);
        }
        let collected = heap.collect_cycles();
        assert_eq!(collected.cyclic, 3);
        assert_eq!(drops.get(), 3);
    }

    #[test]
    fn test_external_reference_keeps_a_cycle() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let first = Node::new(&heap, 1, &drops);
        {
            let second = Node::new(&heap, 2, &drops);
            link(&first, &second);
            link(&second, &first);
        }
        let collected = heap.collect_cycles();
        assert_eq!(collected.total(), 0);
        assert_eq!(drops.get(), 0);
        // The pass restored the counts it removed while probing.
        assert_eq!(first.ref_count(), RefCount::Owned(2));
        assert_eq!(first.next.borrow().as_ref().map(|n| n.label), Some(2));
        drop(first);
        let collected = heap.collect_cycles();
        assert_eq!(collected.cyclic, 2);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn test_cycle_through_vec_payload() {
        struct Group {
            members: RefCell<Vec<Handle<Group>>>,
        }

        unsafe impl Trace for Group {
            fn trace(&self, tracer_fn: &mut TracerFn) {
                self.members.trace(tracer_fn);
            }
        }

        let heap = Heap::new();
        {
            let first = heap.alloc(Group {
                members: RefCell::new(Vec::new()),
            });
            let second = heap.alloc(Group {
                members: RefCell::new(Vec::new()),
            });
            first.members.borrow_mut().push(second.clone());
            second.members.borrow_mut().push(first.clone());
        }
        let collected = heap.collect_cycles();
        assert_eq!(collected.cyclic, 2);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn test_collect_on_an_empty_heap() {
        let heap = Heap::new();
        let collected = heap.collect_cycles();
        assert_eq!(collected.acyclic, 0);
        assert_eq!(collected.cyclic, 0);
        assert_eq!(collected.total(), 0);
        assert_eq!(heap.stats().collections_run, 0);
    }

    #[test]
    fn test_collect_with_only_live_candidates() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        drop(node.clone());
        let collected = heap.collect_cycles();
        assert_eq!(collected.total(), 0);
        assert_eq!(heap.stats().collections_run, 1);
        assert_eq!(node.label, 1);
        assert_eq!(drops.get(), 0);
    }
}

mod roots_tests {
    use super::*;

    #[test]
    fn test_full_buffer_triggers_a_pass() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        for index in 0..MAX_ROOTS {
            let node = Node::new(&heap, index as u32, &drops);
            drop(node.clone());
            // The corpse stays parked after this drop until a pass runs.
        }
        assert_eq!(heap.stats().collections_run, 1);
        assert_eq!(heap.root_count(), 0);
        assert_eq!(drops.get(), MAX_ROOTS);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.stats().freed_acyclic, MAX_ROOTS - 1);
    }

    #[test]
    fn test_live_candidates_survive_the_triggered_pass() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let extra = 10;
        let nodes: Vec<Handle<Node>> = (0..MAX_ROOTS + extra)
            .map(|index| {
                let node = Node::new(&heap, index as u32, &drops);
                drop(node.clone());
                node
            })
            .collect();
        assert_eq!(heap.stats().collections_run, 1);
        assert_eq!(heap.root_count(), extra);
        assert_eq!(drops.get(), 0);
        assert_eq!(heap.stats().live_objects, MAX_ROOTS + extra);
        assert_eq!(nodes[0].label, 0);
        assert_eq!(nodes[MAX_ROOTS + extra - 1].label, (MAX_ROOTS + extra - 1) as u32);
        drop(nodes);
        assert_eq!(drops.get(), MAX_ROOTS + extra);
        let collected = heap.collect_cycles();
        assert_eq!(collected.acyclic, extra);
        assert_eq!(heap.root_count(), 0);
    }

    #[test]
    fn test_cascade_overfill_flushes_on_next_insertion() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let keepers: Vec<Handle<Node>> = (0..MAX_ROOTS + 40)
            .map(|index| Node::new(&heap, index as u32, &drops))
            .collect();
        let holder = heap.alloc(keepers.clone());
        drop(holder.clone());
        assert_eq!(heap.root_count(), 1);
        // Destroying the parked holder cascades a release per keeper.
        // Passes stay off for the duration, so the buffer runs past its
        // bound instead of flushing mid-destructor.
        drop(holder);
        assert!(heap.root_count() > MAX_ROOTS);
        assert_eq!(heap.stats().collections_run, 0);
        let extra = Node::new(&heap, 0, &drops);
        drop(extra.clone());
        // The park itself joins the flush it triggers, so the whole
        // backlog drains in one pass and the survivor leaves unbuffered.
        assert_eq!(heap.stats().collections_run, 1);
        assert_eq!(heap.root_count(), 0);
        assert_eq!(heap.stats().freed_acyclic, 1);
        assert_eq!(drops.get(), 0);
        assert_eq!(keepers[0].ref_count(), RefCount::Owned(1));
        assert_eq!(extra.ref_count(), RefCount::Owned(1));
        drop(extra);
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.root_count(), 0);
    }

    #[test]
    fn test_candidate_parked_into_an_overfull_buffer_is_collected() {
        struct Member {
            links: RefCell<Vec<Handle<Member>>>,
            drops: Rc<Cell<usize>>,
        }

        impl Drop for Member {
            fn drop(&mut self) {
                self.drops.set(self.drops.get() + 1);
            }
        }

        unsafe impl Trace for Member {
            fn trace(&self, tracer_fn: &mut TracerFn) {
                self.links.trace(tracer_fn);
            }
        }

        fn member(heap: &Heap, drops: &Rc<Cell<usize>>) -> Handle<Member> {
            heap.alloc(Member {
                links: RefCell::new(Vec::new()),
                drops: Rc::clone(drops),
            })
        }

        let heap = Heap::new();
        let cycle_drops = Rc::new(Cell::new(0));
        let late_drops = Rc::new(Cell::new(0));
        let keeper_drops = Rc::new(Cell::new(0));

        // A buffered garbage cycle whose members hold the one count the
        // late candidate has besides its own handle.
        let late = member(&heap, &late_drops);
        {
            let first = member(&heap, &cycle_drops);
            let second = member(&heap, &cycle_drops);
            first.links.borrow_mut().push(second.clone());
            first.links.borrow_mut().push(late.clone());
            second.links.borrow_mut().push(first.clone());
        }
        assert_eq!(heap.root_count(), 2);

        // Run the buffer past its bound with a destructor cascade.
        let keepers: Vec<Handle<Node>> = (0..MAX_ROOTS)
            .map(|index| Node::new(&heap, index as u32, &keeper_drops))
            .collect();
        let holder = heap.alloc(keepers.clone());
        drop(holder.clone());
        drop(holder);
        assert_eq!(heap.root_count(), MAX_ROOTS + 3);
        assert_eq!(heap.stats().collections_run, 0);

        // The release parks the candidate into the overfull buffer and
        // the triggered pass runs with it in place: the cycle and the
        // candidate it held go together, in that one pass.
        drop(late);
        assert_eq!(heap.stats().collections_run, 1);
        assert_eq!(late_drops.get(), 1);
        assert_eq!(cycle_drops.get(), 2);
        assert_eq!(keeper_drops.get(), 0);
        assert_eq!(heap.stats().freed_cyclic, 3);
        assert_eq!(heap.stats().freed_acyclic, 1);
        assert_eq!(heap.root_count(), 0);
        assert_eq!(heap.stats().live_objects, MAX_ROOTS);
        assert_eq!(keepers[0].ref_count(), RefCount::Owned(1));
    }
}

mod heap_tests {
    use super::*;

    #[test]
    fn test_heaps_are_isolated() {
        let heap_a = Heap::new();
        let heap_b = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let on_a = Node::new(&heap_a, 1, &drops);
        let on_b = Node::new(&heap_b, 2, &drops);
        drop(on_a.clone());
        drop(on_b.clone());
        assert_eq!(heap_a.root_count(), 1);
        assert_eq!(heap_b.root_count(), 1);
        heap_a.collect_cycles();
        assert_eq!(heap_a.root_count(), 0);
        assert_eq!(heap_b.root_count(), 1);
        assert_eq!(heap_a.stats().live_objects, 1);
        assert_eq!(heap_b.stats().live_objects, 1);
        assert_eq!(on_b.label, 2);
    }

    #[test]
    fn test_current_heap_is_stable_per_thread() {
        let first = Heap::current();
        let second = Heap::current();
        assert!(first.ptr_eq(&second));
        assert!(!Heap::new().ptr_eq(&first));
    }

    #[test]
    fn test_collect_cycles_runs_on_the_current_heap() {
        let heap = Heap::current();
        let drops = Rc::new(Cell::new(0));
        let node = Node::new(&heap, 1, &drops);
        link(&node, &node);
        drop(node);
        let collected = collect_cycles();
        assert_eq!(collected.cyclic, 1);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_stats_track_the_allocation_lifecycle() {
        let heap = Heap::new();
        let first = heap.alloc(1u32);
        let second = heap.alloc(2u32);
        let third = heap.alloc(3u32);
        assert_eq!(heap.stats().objects_allocated, 3);
        assert_eq!(heap.stats().live_objects, 3);
        drop(second);
        assert_eq!(heap.stats().objects_allocated, 3);
        assert_eq!(heap.stats().live_objects, 2);
        assert_eq!(*first + *third, 4);
    }

    #[test]
    fn test_default_heap_is_empty() {
        let heap = Heap::default();
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.root_count(), 0);
    }
}
