//! Tests for the pool-membership differ and its emptiness guards

#[cfg(test)]
mod tests {
    use crate::backend_pool::differ::*;
    use crate::backend_pool::test_support::{
        ip_config_id, pool_ips, pool_with_ip_configs, pool_with_ips,
    };
    use crate::config::BackendPoolType;
    use crate::network::InterfaceIpConfiguration;

    fn refs(ids: &[&str]) -> Vec<InterfaceIpConfiguration> {
        ids.iter().map(|id| InterfaceIpConfiguration::new(*id)).collect()
    }

    fn ids(configs: &[InterfaceIpConfiguration]) -> Vec<&str> {
        configs.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_remove_node_ips_keeps_remaining_entries() {
        let mut bp = pool_with_ips("kubernetes", &["1.2.3.4", "5.6.7.8", "4.3.2.1", ""]);
        let changed =
            remove_node_ip_addresses_from_backend_pool(&mut bp, &["1.2.3.4", "4.3.2.1"], false);
        assert!(changed);
        assert_eq!(pool_ips(&bp), vec!["5.6.7.8".to_string(), String::new()]);
    }

    #[test]
    fn test_remove_node_ips_refuses_to_empty_pool() {
        let mut bp = pool_with_ips("kubernetes", &["1.2.3.4", "4.3.2.1"]);
        let before = bp.clone();
        let changed =
            remove_node_ip_addresses_from_backend_pool(&mut bp, &["1.2.3.4", "4.3.2.1"], false);
        assert!(!changed);
        assert_eq!(bp, before);
    }

    #[test]
    fn test_remove_all_node_ips() {
        let mut bp = pool_with_ips("kubernetes", &["1.2.3.4", "4.3.2.1", ""]);
        let changed =
            remove_node_ip_addresses_from_backend_pool(&mut bp, &["1.2.3.4", "4.3.2.1"], true);
        assert!(changed);
        assert_eq!(pool_ips(&bp), vec![String::new()]);

        let mut bp = pool_with_ips("kubernetes", &["1.2.3.4"]);
        assert!(remove_node_ip_addresses_from_backend_pool(&mut bp, &["1.2.3.4"], true));
        assert!(bp.load_balancer_backend_addresses.is_empty());
    }

    #[test]
    fn test_remove_unknown_node_ips_is_noop() {
        let mut bp = pool_with_ips("kubernetes", &["1.2.3.4"]);
        let unwanted: Vec<String> = Vec::new();
        assert!(!remove_node_ip_addresses_from_backend_pool(&mut bp, &unwanted, false));
        assert!(!remove_node_ip_addresses_from_backend_pool(&mut bp, &["9.9.9.9"], true));
        assert_eq!(pool_ips(&bp), vec!["1.2.3.4".to_string()]);
    }

    #[test]
    fn test_excluded_dropped_when_pool_would_empty() {
        let bp = pool_with_ip_configs(
            "kubernetes",
            &["ipconfig1".into(), "ipconfig2".into(), "ipconfig3".into()],
        );
        let result = backend_ip_configurations_to_be_deleted(
            &bp,
            &refs(&["ipconfig1", "ipconfig2"]),
            &refs(&["ipconfig3"]),
        );
        assert_eq!(ids(&result), vec!["ipconfig1", "ipconfig2"]);
    }

    #[test]
    fn test_not_found_and_excluded_removed_together() {
        let bp = pool_with_ip_configs(
            "kubernetes",
            &["ipconfig1".into(), "ipconfig2".into(), "ipconfig3".into()],
        );
        let result = backend_ip_configurations_to_be_deleted(
            &bp,
            &refs(&["ipconfig1"]),
            &refs(&["ipconfig3"]),
        );
        assert_eq!(ids(&result), vec!["ipconfig1", "ipconfig3"]);
    }

    #[test]
    fn test_all_not_found_empties_pool() {
        let bp = pool_with_ip_configs(
            "kubernetes",
            &["ipconfig1".into(), "ipconfig2".into(), "ipconfig3".into()],
        );
        let result = backend_ip_configurations_to_be_deleted(
            &bp,
            &refs(&["ipconfig1", "ipconfig2", "ipconfig3"]),
            &[],
        );
        assert_eq!(ids(&result), vec!["ipconfig1", "ipconfig2", "ipconfig3"]);
    }

    #[test]
    fn test_excluded_only_never_empties_pool() {
        let bp = pool_with_ip_configs("kubernetes", &[ip_config_id("agentpool1")]);
        let excluded = refs(&[ip_config_id("agentpool1").as_str()]);
        let result = backend_ip_configurations_to_be_deleted(&bp, &[], &excluded);
        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_pool_has_nothing_to_delete() {
        let bp = pool_with_ip_configs("kubernetes", &[]);
        assert!(backend_ip_configurations_to_be_deleted(&bp, &refs(&["ipconfig1"]), &[]).is_empty());
    }

    #[test]
    fn test_diff_addresses() {
        let desired = vec![
            "10.0.0.3".to_string(),
            "10.0.0.1".to_string(),
            "10.0.0.3".to_string(),
        ];
        let (to_add, to_remove) = diff_addresses(["10.0.0.2", "10.0.0.1", "10.0.0.0"], &desired);
        assert_eq!(to_add, vec!["10.0.0.3".to_string()]);
        assert_eq!(to_remove, vec!["10.0.0.0".to_string(), "10.0.0.2".to_string()]);

        let (to_add, to_remove) = diff_addresses(["10.0.0.1"], &["10.0.0.1".to_string()]);
        assert!(to_add.is_empty() && to_remove.is_empty());
    }

    #[test]
    fn test_migration_required() {
        let by_ip = pool_with_ips("kubernetes", &["10.0.0.1"]);
        let by_config = pool_with_ip_configs("kubernetes", &["ipconfig1".into()]);
        let empty = pool_with_ips("kubernetes", &[]);
        let mut mixed = by_config.clone();
        mixed.load_balancer_backend_addresses = by_ip.load_balancer_backend_addresses.clone();

        assert!(migration_required(BackendPoolType::NodeIpConfiguration, &by_ip));
        assert!(!migration_required(BackendPoolType::NodeIpConfiguration, &by_config));
        assert!(migration_required(BackendPoolType::NodeIp, &by_config));
        assert!(!migration_required(BackendPoolType::NodeIp, &by_ip));
        assert!(!migration_required(BackendPoolType::NodeIp, &empty));
        assert!(migration_required(BackendPoolType::NodeIpConfiguration, &mixed));
        assert!(migration_required(BackendPoolType::NodeIp, &mixed));
    }
}
