//! Lock hierarchy: Journal → Allocator → Tree.
//!
//! Every component lock is tagged with a [`LockLevel`]. Taking a lock
//! registers a [`LevelToken`] for the current thread; in debug builds the
//! registration panics if the thread already holds a lock of a *higher*
//! level. Re-entering the same level (recursive journal lock, nested tree
//! calls) is allowed. Release builds keep the bookkeeping out of the path.

#[cfg(debug_assertions)]
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Journal = 0,
    Allocator = 1,
    Tree = 2,
}

impl LockLevel {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Journal => "journal",
            Self::Allocator => "allocator",
            Self::Tree => "tree",
        };
        f.write_str(name)
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: Cell<[u32; LockLevel::COUNT]> = const { Cell::new([0; LockLevel::COUNT]) };
}

/// Proof that the current thread registered a lock at `level`.
///
/// Not `Send`: the registration belongs to the acquiring thread.
#[must_use = "the level is released when the token is dropped"]
pub struct LevelToken {
    level: LockLevel,
    _not_send: PhantomData<*const ()>,
}

impl LevelToken {
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }
}

impl fmt::Debug for LevelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelToken")
            .field("level", &self.level)
            .finish()
    }
}

/// Register intent to take a lock at `level` on this thread.
///
/// # Panics
///
/// In debug builds, panics when a lock of a higher level is already held by
/// this thread.
pub fn enter(level: LockLevel) -> LevelToken {
    #[cfg(debug_assertions)]
    HELD.with(|held| {
        let mut counts = held.get();
        if let Some(higher) = counts[level.index() + 1..]
            .iter()
            .position(|count| *count > 0)
        {
            let higher = level.index() + 1 + higher;
            let names = ["journal", "allocator", "tree"];
            panic!(
                "lock order violation: acquiring {level} while holding {}",
                names[higher]
            );
        }
        counts[level.index()] += 1;
        held.set(counts);
    });
    LevelToken {
        level,
        _not_send: PhantomData,
    }
}

/// Number of registrations this thread holds at `level` (debug builds only;
/// release builds always report 0).
#[must_use]
pub fn held(level: LockLevel) -> u32 {
    #[cfg(debug_assertions)]
    {
        HELD.with(|held| held.get()[level.index()])
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = level;
        0
    }
}

impl Drop for LevelToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let mut counts = held.get();
            counts[self.level.index()] = counts[self.level.index()].saturating_sub(1);
            held.set(counts);
        });
    }
}
