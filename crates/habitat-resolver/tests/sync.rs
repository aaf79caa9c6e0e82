//! End-to-end resolution scenarios against real local git repositories.

use habitat_resolver::{fetch_component, fetch_deps_only, load_solutions, SharedMaps};
use habitat_types::{RuntimeContext, SyncOptions};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const VERSION: &str = "0.3.0";

fn options(tmp: &TempDir) -> SyncOptions {
    SyncOptions {
        disable_cache: true,
        cache_dir: tmp.path().join("cache"),
        runtime: RuntimeContext {
            http_concurrency: 4,
            max_dependency_wait: std::time::Duration::from_secs(30),
        },
        ..Default::default()
    }
}

async fn git(args: &[&str], cwd: &Path) {
    habitat_git::git(args.iter().copied())
        .cwd(cwd)
        .run()
        .await
        .unwrap_or_else(|e| panic!("git {args:?} in {} failed: {e}", cwd.display()));
}

async fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(&["init", "--initial-branch=master"], dir).await;
    git(&["config", "user.email", "test@example.com"], dir).await;
    git(&["config", "user.name", "test"], dir).await;
    // Commit pins are fetched as exact shas.
    git(&["config", "uploadpack.allowAnySHA1InWant", "true"], dir).await;
}

async fn commit_all(dir: &Path, message: &str) -> String {
    git(&["add", "."], dir).await;
    git(&["commit", "-m", message], dir).await;
    habitat_git::head_commit_id(dir).await.unwrap()
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn file_url(path: &Path) -> String {
    format!("file://{}/.git", path.display())
}

/// A host repository carrying `.habitat` and `DEPS`, resolved in place.
async fn host_repo(tmp: &TempDir, deps: &str) -> PathBuf {
    let root = tmp.path().join("main");
    init_repo(&root).await;
    write(
        &root.join(".habitat"),
        &format!(
            "[[solutions]]\nname = \".\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&root)
        ),
    );
    write(&root.join("DEPS"), deps);
    commit_all(&root, "add configuration").await;
    root
}

async fn sync_deps_only(root: &Path, options: &SyncOptions) -> Result<(), habitat_resolver::ResolveError> {
    let solutions = load_solutions(root, VERSION, false, true).await?;
    for solution in solutions {
        let shared = SharedMaps::new();
        fetch_deps_only(solution, root, options, &shared).await?;
    }
    Ok(())
}

async fn sync_main(root: &Path, options: &SyncOptions) -> Result<(), habitat_resolver::ResolveError> {
    let solutions = load_solutions(root, VERSION, false, true).await?;
    for solution in solutions {
        let shared = SharedMaps::new();
        fetch_component(solution, root.to_path_buf(), options.clone(), shared).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_sync_tag_checkout() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("repos/lib");
    init_repo(&lib).await;
    write(&lib.join("test"), "test");
    commit_all(&lib, "add test file").await;
    git(&["tag", "v0.0.1"], &lib).await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.test]\ntype = \"git\"\nurl = \"{}\"\ntag = \"v0.0.1\"\n",
            file_url(&lib)
        ),
    )
    .await;

    sync_deps_only(&root, &options(&tmp)).await.unwrap();

    let checkout = root.join("test");
    assert_eq!(std::fs::read_to_string(checkout.join("test")).unwrap(), "test");
    let head = habitat_git::head_commit_id(&checkout).await.unwrap();
    let tagged = habitat_git::git(["rev-parse", "v0.0.1^{commit}"])
        .cwd(&lib)
        .output()
        .await
        .unwrap();
    assert_eq!(head, tagged);
}

#[tokio::test]
async fn test_sync_recursively_duplicated_source() {
    let tmp = TempDir::new().unwrap();
    let git2 = tmp.path().join("repos/git2");
    init_repo(&git2).await;
    write(&git2.join("test"), "test");
    commit_all(&git2, "add test").await;

    let git3 = tmp.path().join("repos/git3");
    init_repo(&git3).await;
    write(&git3.join("subsub1/test"), "test");
    write(
        &git3.join("DEPS"),
        &format!(
            "[deps.subsub2]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git2)
        ),
    );
    commit_all(&git3, "add subsub deps").await;

    let git1 = tmp.path().join("repos/git1");
    init_repo(&git1).await;
    write(
        &git1.join("DEPS"),
        &format!(
            "[deps.sub1]\ntype = \"solution\"\nurl = \"{}\"\nbranch = \"master\"\n\n\
             [deps.sub2]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git3),
            file_url(&git2)
        ),
    );
    commit_all(&git1, "add deps").await;

    let root = tmp.path().join("work/main");
    std::fs::create_dir_all(&root).unwrap();
    write(
        &root.join(".habitat"),
        &format!(
            "[[solutions]]\nname = \".\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git1)
        ),
    );

    sync_main(&root, &options(&tmp)).await.unwrap();

    assert!(root.join("sub1/subsub1").is_dir());
    let link = root.join("sub1/subsub2");
    assert!(link.symlink_metadata().unwrap().is_symlink());
    assert_eq!(
        link.canonicalize().unwrap(),
        root.join("sub2").canonicalize().unwrap()
    );
    assert!(root.join("sub2/.git").is_dir());
}

#[tokio::test]
async fn test_sync_recursively_targets_conflicts() {
    let tmp = TempDir::new().unwrap();
    let git2 = tmp.path().join("repos/git2");
    init_repo(&git2).await;
    write(&git2.join("test"), "test");
    commit_all(&git2, "add test").await;

    // git3 tries to claim its sibling's directory with a different source.
    let git3 = tmp.path().join("repos/git3");
    init_repo(&git3).await;
    write(&git3.join("subsub1/test"), "test");
    write(
        &git3.join("DEPS"),
        &format!(
            "[deps.\"../sub1\"]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&tmp.path().join("repos/git4"))
        ),
    );
    commit_all(&git3, "add conflicting deps").await;

    let git1 = tmp.path().join("repos/git1");
    init_repo(&git1).await;
    write(
        &git1.join("DEPS"),
        &format!(
            "[deps.sub1]\ntype = \"solution\"\nurl = \"{}\"\nbranch = \"master\"\n\n\
             [deps.sub2]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git3),
            file_url(&git2)
        ),
    );
    commit_all(&git1, "add deps").await;

    let root = tmp.path().join("work/main");
    std::fs::create_dir_all(&root).unwrap();
    write(
        &root.join(".habitat"),
        &format!(
            "[[solutions]]\nname = \".\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git1)
        ),
    );

    sync_main(&root, &options(&tmp)).await.unwrap();

    assert!(root.join("sub1/subsub1").is_dir());
    assert!(root.join("sub2/.git").is_dir());
    // The conflicting node was skipped: sub1 is still git3's checkout.
    assert!(root.join("sub1/DEPS").exists());
}

#[tokio::test]
async fn test_sync_git_repo_with_patches() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    init_repo(&lib).await;
    write(&lib.join("hello.py"), "print(\"hello, world.\")");
    let first_commit = commit_all(&lib, "add hello world").await;
    write(
        &lib.join("hello.py"),
        "print(\"hello, world.\")\nprint(\"thanks!\")",
    );
    commit_all(&lib, "add thanks").await;
    write(&lib.join("hello.py"), "print(\"done\")");
    commit_all(&lib, "done").await;
    write(&lib.join("hello.py"), "print(\"not yet\")");
    commit_all(&lib, "not yet").await;
    git(&["format-patch", "HEAD^^^"], &lib).await;

    let main = tmp.path().join("main");
    init_repo(&main).await;
    for (src, dst) in [
        ("0001-add-thanks.patch", "patches/0001-add-thanks.patch"),
        ("0002-done.patch", "patches/0002-done.patch"),
        ("0003-not-yet.patch", "other_patches/0003-not-yet.patch"),
    ] {
        let content = std::fs::read_to_string(lib.join(src)).unwrap();
        write(&main.join(dst), &content);
    }
    write(
        &main.join(".habitat"),
        &format!(
            "[[solutions]]\nname = \".\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&main)
        ),
    );
    write(
        &main.join("DEPS"),
        &format!(
            "[deps.lib]\n\
             type = \"git\"\n\
             url = \"{url}\"\n\
             commit = \"{commit}\"\n\
             patches = \"{root}/main/patches/*.patch\"\n\n\
             [deps.lib-with-one-more-patch]\n\
             type = \"git\"\n\
             url = \"{url}\"\n\
             commit = \"{commit}\"\n\
             patches = [\"{root}/main/patches/*.patch\", \"{root}/main/other_patches/*.patch\"]\n",
            url = file_url(&lib),
            commit = first_commit,
            root = tmp.path().display(),
        ),
    );
    commit_all(&main, "submit patches").await;

    sync_deps_only(&main, &options(&tmp)).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(main.join("lib/hello.py")).unwrap(),
        "print(\"done\")"
    );
    assert_eq!(
        std::fs::read_to_string(main.join("lib-with-one-more-patch/hello.py")).unwrap(),
        "print(\"not yet\")"
    );
}

#[tokio::test]
async fn test_sync_dependency_with_cycled_requirement() {
    let tmp = TempDir::new().unwrap();
    let dep = tmp.path().join("dep");
    init_repo(&dep).await;
    write(&dep.join("f"), "f");
    commit_all(&dep, "add file").await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.test_a]\ntype = \"git\"\nurl = \"{url}\"\nbranch = \"master\"\nrequire = [\"test_b\"]\n\n\
             [deps.test_b]\ntype = \"git\"\nurl = \"{url}\"\nbranch = \"master\"\nrequire = [\"test_a\"]\n",
            url = file_url(&dep)
        ),
    )
    .await;

    let err = sync_deps_only(&root, &options(&tmp)).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("circular dependency"), "got: {message}");
    assert!(message.contains("test_a") && message.contains("test_b"));
    assert!(!root.join("test_a").exists());
    assert!(!root.join("test_b").exists());
}

#[tokio::test]
async fn test_require_orders_sibling_fetches() {
    let tmp = TempDir::new().unwrap();
    let root = host_repo(
        &tmp,
        "[deps.first]\n\
         type = \"action\"\n\
         commands = [\"sleep 0.2\", \"echo first >> {root_dir}/order.log\"]\n\n\
         [deps.second]\n\
         type = \"action\"\n\
         commands = [\"echo second >> {root_dir}/order.log\"]\n\
         require = [\"first\"]\n",
    )
    .await;

    sync_deps_only(&root, &options(&tmp)).await.unwrap();

    let log = std::fs::read_to_string(root.join("order.log")).unwrap();
    assert_eq!(log, "first\nsecond\n");
}

#[tokio::test]
async fn test_actions_are_never_cached() {
    let tmp = TempDir::new().unwrap();
    let root = host_repo(
        &tmp,
        "[deps.log-action]\ntype = \"action\"\ncommands = [\"echo ran >> {root_dir}/action.log\"]\n",
    )
    .await;

    let options = options(&tmp);
    sync_deps_only(&root, &options).await.unwrap();
    sync_deps_only(&root, &options).await.unwrap();

    let log = std::fs::read_to_string(root.join("action.log")).unwrap();
    assert_eq!(log.lines().count(), 2);
}

#[tokio::test]
async fn test_entries_cache_skips_pinned_up_to_date_dependency() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    init_repo(&lib).await;
    write(&lib.join("f"), "f");
    let commit = commit_all(&lib, "add file").await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.lib]\ntype = \"git\"\nurl = \"{}\"\ncommit = \"{commit}\"\n",
            file_url(&lib)
        ),
    )
    .await;

    let options = options(&tmp);
    sync_deps_only(&root, &options).await.unwrap();
    assert!(root.join("lib/f").exists());

    // With a matching entries cache and a full 40-hex pin, a second run must
    // not touch the target at all.
    habitat_fs::rmtree(&root.join("lib")).unwrap();
    sync_deps_only(&root, &options).await.unwrap();
    assert!(!root.join("lib").exists());

    let forced = SyncOptions {
        force: true,
        ..options
    };
    sync_deps_only(&root, &forced).await.unwrap();
    assert!(root.join("lib/f").exists());
}

#[tokio::test]
async fn test_strict_mode_raises_on_stamp_conflict() {
    let tmp = TempDir::new().unwrap();
    let git2 = tmp.path().join("repos/git2");
    init_repo(&git2).await;
    write(&git2.join("test"), "test");
    let pinned = commit_all(&git2, "add test").await;

    let git3 = tmp.path().join("repos/git3");
    init_repo(&git3).await;
    write(
        &git3.join("DEPS"),
        &format!(
            "[deps.subsub2]\ntype = \"git\"\nurl = \"{}\"\ncommit = \"{pinned}\"\n",
            file_url(&git2)
        ),
    );
    commit_all(&git3, "pin git2").await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.sub1]\ntype = \"solution\"\nurl = \"{}\"\nbranch = \"master\"\n\n\
             [deps.sub2]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&git3),
            file_url(&git2)
        ),
    )
    .await;

    let strict = SyncOptions {
        strict: true,
        ..options(&tmp)
    };
    let err = sync_deps_only(&root, &strict).await.unwrap_err();
    assert!(err.to_string().contains("source stamps conflict"), "got: {err}");

    // Non-strict resolves the conflict with a direct fetch.
    sync_deps_only(&root, &options(&tmp)).await.unwrap();
    let subsub2 = root.join("sub1/subsub2");
    assert!(subsub2.join("test").exists());
    assert!(!subsub2.symlink_metadata().unwrap().is_symlink());
}

#[tokio::test]
async fn test_sync_target_only() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("base-deps");
    init_repo(&base).await;
    write(&base.join("base.txt"), "i am base deps");
    commit_all(&base, "add deps").await;
    let android = tmp.path().join("android-deps");
    init_repo(&android).await;
    write(&android.join("android.txt"), "i am android deps");
    commit_all(&android, "add deps").await;

    let root = tmp.path().join("test-repo");
    init_repo(&root).await;
    write(
        &root.join(".habitat"),
        &format!(
            "[[solutions]]\nname = \".\"\nurl = \"{}\"\nbranch = \"master\"\n\
             target_deps_files = {{ android = \"DEPS.android\" }}\n",
            file_url(&root)
        ),
    );
    write(
        &root.join("DEPS"),
        &format!(
            "[deps.base]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&base)
        ),
    );
    write(
        &root.join("DEPS.android"),
        &format!(
            "[deps.android]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&android)
        ),
    );
    commit_all(&root, "add configuration").await;

    let target_only = SyncOptions {
        target: Some("android".to_string()),
        target_only: true,
        ..options(&tmp)
    };
    sync_deps_only(&root, &target_only).await.unwrap();
    assert!(!root.join("base").exists());
    assert!(root.join("android/android.txt").exists());

    let no_target = SyncOptions {
        target_only: true,
        ..options(&tmp)
    };
    sync_deps_only(&root, &no_target).await.unwrap();
    assert!(root.join("base/base.txt").exists());
}

#[tokio::test]
async fn test_sync_raw_checkout_discards_repository() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    init_repo(&lib).await;
    write(&lib.join("test"), "test");
    commit_all(&lib, "add test").await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.raw-dep]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&lib)
        ),
    )
    .await;

    let raw = SyncOptions {
        raw: true,
        ..options(&tmp)
    };
    sync_deps_only(&root, &raw).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(root.join("raw-dep/test")).unwrap(),
        "test"
    );
    assert!(!root.join("raw-dep/.git").exists());
}

#[tokio::test]
async fn test_git_object_cache_wires_alternates() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    init_repo(&lib).await;
    write(&lib.join("test"), "test");
    commit_all(&lib, "add test").await;

    let root = host_repo(
        &tmp,
        &format!(
            "[deps.cached]\ntype = \"git\"\nurl = \"{}\"\nbranch = \"master\"\n",
            file_url(&lib)
        ),
    )
    .await;

    let cached = SyncOptions {
        disable_cache: false,
        ..options(&tmp)
    };
    sync_deps_only(&root, &cached).await.unwrap();

    let alternates = root.join("cached/.git/objects/info/alternates");
    let objects_dir = std::fs::read_to_string(&alternates).unwrap();
    assert!(objects_dir.contains("cache"));
    assert!(Path::new(objects_dir.trim()).is_dir());
    assert!(tmp.path().join("cache/git").is_dir());
}
