use git2::Repository;
use runner_git::{CheckoutRequest, GitCheckoutManager};
use tempfile::tempdir;

fn init_origin_repo(dir: &std::path::Path) -> String {
    let repo = Repository::init(dir).unwrap();
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("Test", "test@example.com").unwrap();
    let commit_id = repo
        .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    repo.set_head("refs/heads/main").unwrap();
    repo.reference(
        "refs/heads/main",
        commit_id,
        true,
        "set main",
    )
    .unwrap();
    commit_id.to_string()
}

#[tokio::test]
async fn checkout_clones_from_local_mirror() {
    let origin_dir = tempdir().unwrap();
    let sha = init_origin_repo(origin_dir.path());

    let cache_dir = tempdir().unwrap();
    let target_dir = tempdir().unwrap();
    let target_path = target_dir.path().join("workdir");

    let manager = GitCheckoutManager::new(cache_dir.path());
    let req = CheckoutRequest {
        repo_id: "local-test-repo".to_string(),
        clone_url: format!("file://{}", origin_dir.path().display()),
        r#ref: "main".to_string(),
        sha,
        ssh_key_pem: String::new(),
        target_dir: target_path.clone(),
        depth: None,
    };

    let result = manager.checkout(req).await.unwrap();
    assert_eq!(result, target_path);
    assert!(target_path.join("README.md").exists());
}

#[tokio::test]
async fn checkout_reuses_mirror_on_second_call() {
    let origin_dir = tempdir().unwrap();
    let sha = init_origin_repo(origin_dir.path());

    let cache_dir = tempdir().unwrap();
    let target_dir = tempdir().unwrap();

    let manager = GitCheckoutManager::new(cache_dir.path());
    for i in 0..2 {
        let req = CheckoutRequest {
            repo_id: "reused-repo".to_string(),
            clone_url: format!("file://{}", origin_dir.path().display()),
            r#ref: "main".to_string(),
            sha: sha.clone(),
            ssh_key_pem: String::new(),
            target_dir: target_dir.path().join(format!("workdir-{i}")),
            depth: None,
        };
        manager.checkout(req).await.unwrap();
    }

    assert!(cache_dir
        .path()
        .join("git-mirrors")
        .join("local-test-repo")
        .exists()
        || cache_dir
            .path()
            .join("git-mirrors")
            .join("reused-repo")
            .exists());
}
