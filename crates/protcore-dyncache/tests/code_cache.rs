use protcore_dyncache::{
    page_size, CacheError, CacheOptions, CacheState, CodeCache, DynCoreFlags, PermMethod,
};

fn impossible() -> CacheOptions {
    CacheOptions {
        force_impossible: true,
        ..Default::default()
    }
}

#[test]
fn forced_impossible_policy_is_reported() {
    let cache = CodeCache::allocate(4096, &impossible()).unwrap();
    let policy = cache.policy();
    assert!(policy.flags.contains(DynCoreFlags::IMPOSSIBLE));
    assert!(!policy.can_execute());
    assert_eq!(policy.method, PermMethod::None);
}

#[test]
fn capacity_is_rounded_to_pages() {
    let cache = CodeCache::allocate(page_size() + 1, &impossible()).unwrap();
    assert_eq!(cache.capacity(), 2 * page_size());
}

#[test]
fn exec_view_is_refused_while_writable() {
    let mut cache = CodeCache::allocate(128, &CacheOptions::default()).unwrap();
    assert!(matches!(cache.exec_view(), Err(CacheError::WrongState { .. })));
    {
        let mut window = cache.begin_write().unwrap();
        window[0] = 0xc3;
    }
    assert_eq!(cache.state(), CacheState::Writable);
    assert!(matches!(
        cache.exec_view(),
        Err(CacheError::WrongState {
            actual: CacheState::Writable,
            expected: CacheState::Executable
        })
    ));
}

#[test]
fn committed_bytes_are_visible_through_exec_view() {
    for opts in [
        CacheOptions::default(),
        CacheOptions {
            deny_rwx: true,
            ..Default::default()
        },
        CacheOptions {
            deny_rwx: true,
            deny_dual_mapping: true,
            ..Default::default()
        },
        impossible(),
    ] {
        let mut cache = CodeCache::allocate(256, &opts).unwrap();
        {
            let mut window = cache.begin_write().unwrap();
            window[..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        cache.commit().unwrap();
        assert_eq!(&cache.exec_view().unwrap()[..4], &[1, 2, 3, 4], "{opts:?}");

        // Rewriting after a commit reopens the window with the old contents.
        {
            let mut window = cache.begin_write().unwrap();
            assert_eq!(window[0], 1);
            window[0] = 9;
        }
        cache.commit().unwrap();
        assert_eq!(cache.exec_view().unwrap()[0], 9);
    }
}

#[cfg(unix)]
#[test]
fn denied_rwx_never_yields_an_rwx_policy() {
    let opts = CacheOptions {
        deny_rwx: true,
        ..Default::default()
    };
    let cache = CodeCache::allocate(4096, &opts).unwrap();
    let policy = cache.policy();
    assert_ne!(policy.method, PermMethod::Rwx);
    if policy.can_execute() {
        assert!(policy.flags.contains(DynCoreFlags::W_XOR_X));
    }
}

#[test]
fn flush_drops_back_to_uncommitted() {
    let mut cache = CodeCache::allocate(64, &CacheOptions::default()).unwrap();
    drop(cache.begin_write().unwrap());
    cache.commit().unwrap();
    cache.flush();
    assert_eq!(cache.state(), CacheState::Uncommitted);
    assert_eq!(cache.flushes(), 1);
    assert!(cache.exec_view().is_err());
}
