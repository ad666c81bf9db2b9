//! Login security and MFA compliance, per user and per role.

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::rules::{Rule, RuleList};
use crate::analysis::Bucket;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MfaStatus {
    Compliant,
    Partial,
    Missing,
}

impl MfaStatus {
    pub fn label(self) -> &'static str {
        match self {
            MfaStatus::Compliant => "MFA Compliant",
            MfaStatus::Partial => "Partial MFA",
            MfaStatus::Missing => "No MFA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityRisk {
    Low,
    Medium,
    High,
}

impl SecurityRisk {
    pub fn label(self) -> &'static str {
        match self {
            SecurityRisk::High => "High Risk - Multiple Failed Logins",
            SecurityRisk::Medium => "Medium Risk - Some Failed Attempts",
            SecurityRisk::Low => "Low Risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleCompliance {
    Compliant,
    PartiallyCompliant,
    NonCompliant,
}

impl RoleCompliance {
    pub fn label(self) -> &'static str {
        match self {
            RoleCompliance::Compliant => "Compliant",
            RoleCompliance::PartiallyCompliant => "Partially Compliant",
            RoleCompliance::NonCompliant => "Non-Compliant",
        }
    }
}

/// Login counters of one user for one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginSignals {
    pub logins: u64,
    pub failed: u64,
    pub mfa: u64,
    pub password_only: u64,
}

pub static MFA_RULES: RuleList<LoginSignals, MfaStatus> = RuleList {
    rules: &[
        Rule { label: MfaStatus::Compliant, when: |s: &LoginSignals| s.mfa > 0 && s.password_only == 0 },
        Rule { label: MfaStatus::Partial, when: |s: &LoginSignals| s.mfa > 0 },
    ],
    otherwise: MfaStatus::Missing,
};

pub static SECURITY_RISK_RULES: RuleList<LoginSignals, SecurityRisk> = RuleList {
    rules: &[
        Rule { label: SecurityRisk::High, when: |s: &LoginSignals| s.failed > 5 },
        Rule { label: SecurityRisk::High, when: |s: &LoginSignals| s.mfa == 0 && s.failed > 0 },
        Rule {
            label: SecurityRisk::Medium,
            when: |s: &LoginSignals| s.password_only > 0 || s.failed > 0,
        },
    ],
    otherwise: SecurityRisk::Low,
};

/// Member counts of one role for one day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoleSignals {
    pub active_users: u64,
    pub compliant_users: u64,
}

pub static ROLE_COMPLIANCE_RULES: RuleList<RoleSignals, RoleCompliance> = RuleList {
    rules: &[
        Rule {
            label: RoleCompliance::Compliant,
            when: |s: &RoleSignals| s.active_users > 0 && s.compliant_users == s.active_users,
        },
        Rule {
            label: RoleCompliance::PartiallyCompliant,
            when: |s: &RoleSignals| 2 * s.compliant_users > s.active_users,
        },
    ],
    otherwise: RoleCompliance::NonCompliant,
};

impl LoginSignals {
    pub fn from_record(record: &MetricRecord) -> Self {
        let m = &record.metrics;
        Self {
            logins: m.login_count,
            failed: m.failed_login_count,
            mfa: m.mfa_login_count,
            password_only: m.password_only_login_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSecurity {
    pub date: NaiveDate,
    pub user: String,
    pub logins: u64,
    pub failed_logins: u64,
    pub mfa_logins: u64,
    pub password_only_logins: u64,
    pub mfa_status: MfaStatus,
    pub risk: SecurityRisk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSecurity {
    pub date: NaiveDate,
    pub role: String,
    pub active_users: u64,
    pub mfa_compliant_users: u64,
    pub compliance_pct: f64,
    pub failed_logins: u64,
    pub status: RoleCompliance,
}

/// Assess user-level login records (grouping: user).
pub fn assess_users(records: &[MetricRecord]) -> Vec<UserSecurity> {
    records
        .iter()
        .filter_map(|r| {
            let user = r.entity.user.clone()?;
            let signals = LoginSignals::from_record(r);
            Some(UserSecurity {
                date: r.bucket.date(),
                user,
                logins: signals.logins,
                failed_logins: signals.failed,
                mfa_logins: signals.mfa,
                password_only_logins: signals.password_only,
                mfa_status: MFA_RULES.classify(&signals),
                risk: SECURITY_RISK_RULES.classify(&signals),
            })
        })
        .collect()
}

/// Assess roles from per-member login records (grouping: role + user).
pub fn assess_roles(records: &[MetricRecord]) -> Vec<RoleSecurity> {
    let mut by_role: BTreeMap<(Bucket, String), (RoleSignals, u64)> = BTreeMap::new();
    for r in records {
        let Some(role) = r.entity.role.clone() else {
            continue;
        };
        let signals = LoginSignals::from_record(r);
        let slot = by_role.entry((r.bucket, role)).or_default();
        slot.0.active_users += 1;
        if MFA_RULES.classify(&signals) == MfaStatus::Compliant {
            slot.0.compliant_users += 1;
        }
        slot.1 += signals.failed;
    }

    by_role
        .into_iter()
        .map(|((bucket, role), (signals, failed))| RoleSecurity {
            date: bucket.date(),
            role,
            active_users: signals.active_users,
            mfa_compliant_users: signals.compliant_users,
            compliance_pct: if signals.active_users > 0 {
                signals.compliant_users as f64 / signals.active_users as f64 * 100.0
            } else {
                0.0
            },
            failed_logins: failed,
            status: ROLE_COMPLIANCE_RULES.classify(&signals),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKey;
    use crate::metrics::UsageMetrics;

    fn record(user: &str, role: Option<&str>, s: LoginSignals) -> MetricRecord {
        MetricRecord {
            bucket: Bucket::Day(NaiveDate::from_ymd_opt(2025, 8, 18).unwrap()),
            entity: EntityKey {
                user: Some(user.into()),
                role: role.map(String::from),
                ..Default::default()
            },
            metrics: UsageMetrics {
                login_count: s.logins,
                failed_login_count: s.failed,
                mfa_login_count: s.mfa,
                password_only_login_count: s.password_only,
                ..Default::default()
            },
        }
    }

    fn signals(logins: u64, failed: u64, mfa: u64, password_only: u64) -> LoginSignals {
        LoginSignals { logins, failed, mfa, password_only }
    }

    #[test]
    fn test_mfa_status() {
        assert_eq!(MFA_RULES.classify(&signals(3, 0, 3, 0)), MfaStatus::Compliant);
        assert_eq!(MFA_RULES.classify(&signals(3, 0, 2, 1)), MfaStatus::Partial);
        assert_eq!(MFA_RULES.classify(&signals(3, 0, 0, 3)), MfaStatus::Missing);
    }

    #[test]
    fn test_security_risk_order() {
        // Many failures is high even with MFA.
        assert_eq!(SECURITY_RISK_RULES.classify(&signals(10, 6, 4, 0)), SecurityRisk::High);
        // A failure without any MFA is high.
        assert_eq!(SECURITY_RISK_RULES.classify(&signals(3, 1, 0, 2)), SecurityRisk::High);
        assert_eq!(SECURITY_RISK_RULES.classify(&signals(3, 1, 2, 0)), SecurityRisk::Medium);
        assert_eq!(SECURITY_RISK_RULES.classify(&signals(3, 0, 0, 3)), SecurityRisk::Medium);
        assert_eq!(SECURITY_RISK_RULES.classify(&signals(3, 0, 3, 0)), SecurityRisk::Low);
    }

    #[test]
    fn test_assess_roles_counts_compliant_members() {
        let records = vec![
            record("ALICE", Some("ANALYST"), signals(2, 0, 2, 0)),
            record("BOB", Some("ANALYST"), signals(2, 1, 0, 1)),
            record("CAROL", Some("ANALYST"), signals(1, 0, 1, 0)),
            record("DAVE", Some("LOADER"), signals(1, 0, 1, 0)),
        ];
        let roles = assess_roles(&records);
        assert_eq!(roles.len(), 2);
        let analyst = &roles[0];
        assert_eq!(analyst.role, "ANALYST");
        assert_eq!(analyst.active_users, 3);
        assert_eq!(analyst.mfa_compliant_users, 2);
        assert_eq!(analyst.failed_logins, 1);
        assert_eq!(analyst.status, RoleCompliance::PartiallyCompliant);
        assert_eq!(roles[1].status, RoleCompliance::Compliant);
        assert_eq!(roles[1].compliance_pct, 100.0);
    }

    #[test]
    fn test_assess_users() {
        let users = assess_users(&[record("BOB", None, signals(7, 6, 1, 0))]);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].risk, SecurityRisk::High);
        assert_eq!(users[0].mfa_status.label(), "MFA Compliant");
    }

    #[test]
    fn test_risk_labels_match_dashboard_filters() {
        assert_eq!(SecurityRisk::High.label(), "High Risk - Multiple Failed Logins");
        assert_eq!(SecurityRisk::Medium.label(), "Medium Risk - Some Failed Attempts");
        assert_eq!(SecurityRisk::Low.label(), "Low Risk");
    }
}
