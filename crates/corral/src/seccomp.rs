//! Compiles the symbolic seccomp description of a spec into the runtime's own enumerations.
//! Building and loading the BPF program is left to the process launcher.
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::spec::LinuxSeccomp;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Kill = 1,
    Errno,
    Trap,
    Allow,
    Trace,
    Log,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    EqualTo = 1,
    NotEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    MaskEqualTo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arg {
    pub index: u32,
    pub value: u64,
    pub value_two: u64,
    pub op: Operator,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    pub name: String,
    pub action: Action,
    pub errno_ret: Option<u32>,
    pub args: Vec<Arg>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Seccomp {
    pub default_action: Action,
    pub default_errno_ret: Option<u32>,
    /// Short architecture names such as "amd64" or "arm64".
    pub architectures: Vec<String>,
    pub syscalls: Vec<Syscall>,
}

fn translate_action(action: &str) -> Result<Action, ValidationError> {
    match action {
        "SCMP_ACT_KILL" => Ok(Action::Kill),
        "SCMP_ACT_ERRNO" => Ok(Action::Errno),
        "SCMP_ACT_TRAP" => Ok(Action::Trap),
        "SCMP_ACT_ALLOW" => Ok(Action::Allow),
        "SCMP_ACT_TRACE" => Ok(Action::Trace),
        "SCMP_ACT_LOG" => Ok(Action::Log),
        _ => Err(ValidationError::UnknownSeccompAction(action.to_owned())),
    }
}

fn translate_op(op: &str) -> Result<Operator, ValidationError> {
    match op {
        "SCMP_CMP_NE" => Ok(Operator::NotEqualTo),
        "SCMP_CMP_LT" => Ok(Operator::LessThan),
        "SCMP_CMP_LE" => Ok(Operator::LessThanOrEqualTo),
        "SCMP_CMP_EQ" => Ok(Operator::EqualTo),
        "SCMP_CMP_GE" => Ok(Operator::GreaterThanOrEqualTo),
        "SCMP_CMP_GT" => Ok(Operator::GreaterThan),
        "SCMP_CMP_MASKED_EQ" => Ok(Operator::MaskEqualTo),
        _ => Err(ValidationError::UnknownSeccompOperator(op.to_owned())),
    }
}

fn translate_arch(arch: &str) -> Result<&'static str, ValidationError> {
    match arch {
        "SCMP_ARCH_X86" => Ok("x86"),
        "SCMP_ARCH_X86_64" => Ok("amd64"),
        "SCMP_ARCH_X32" => Ok("x32"),
        "SCMP_ARCH_ARM" => Ok("arm"),
        "SCMP_ARCH_AARCH64" => Ok("arm64"),
        "SCMP_ARCH_MIPS" => Ok("mips"),
        "SCMP_ARCH_MIPS64" => Ok("mips64"),
        "SCMP_ARCH_MIPS64N32" => Ok("mips64n32"),
        "SCMP_ARCH_MIPSEL" => Ok("mipsel"),
        "SCMP_ARCH_MIPSEL64" => Ok("mipsel64"),
        "SCMP_ARCH_MIPSEL64N32" => Ok("mipsel64n32"),
        "SCMP_ARCH_PPC" => Ok("ppc"),
        "SCMP_ARCH_PPC64" => Ok("ppc64"),
        "SCMP_ARCH_PPC64LE" => Ok("ppc64le"),
        "SCMP_ARCH_S390" => Ok("s390"),
        "SCMP_ARCH_S390X" => Ok("s390x"),
        _ => Err(ValidationError::UnknownSeccompArch(arch.to_owned())),
    }
}

/// Returns `None` when the `Spec` asks for no filtering: no default action and no rules.
///
/// A rule naming several syscalls becomes one [`Syscall`] per name, in rule order.
pub fn setup_seccomp(config: Option<&LinuxSeccomp>) -> Result<Option<Seccomp>, ValidationError> {
    let config = match config {
        Some(config) => config,
        None => return Ok(None),
    };

    if config.default_action.is_empty() && config.syscalls.is_empty() {
        return Ok(None);
    }

    if !config.flags.is_empty() {
        return Err(ValidationError::UnsupportedSeccompFlags(
            config.flags.clone(),
        ));
    }

    let architectures = config
        .architectures
        .iter()
        .map(|arch| translate_arch(arch).map(str::to_owned))
        .collect::<Result<Vec<_>, _>>()?;

    let default_action = translate_action(&config.default_action)?;

    let mut syscalls = Vec::new();
    for rule in &config.syscalls {
        let action = translate_action(&rule.action)?;
        let args = rule
            .args
            .iter()
            .map(|arg| {
                Ok(Arg {
                    index: arg.index,
                    value: arg.value,
                    value_two: arg.value_two,
                    op: translate_op(&arg.op)?,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        syscalls.extend(rule.names.iter().map(|name| Syscall {
            name: name.clone(),
            action,
            errno_ret: rule.errno_ret,
            args: args.clone(),
        }));
    }

    tracing::debug!(rules = syscalls.len(), ?default_action, "compiled seccomp");
    Ok(Some(Seccomp {
        default_action,
        default_errno_ret: config.default_errno_ret,
        architectures,
        syscalls,
    }))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::spec::{LinuxSeccompArg, LinuxSyscall};

    #[test]
    fn test_absent_or_empty_disables_filtering() -> Result<()> {
        assert_eq!(setup_seccomp(None)?, None);
        assert_eq!(setup_seccomp(Some(&LinuxSeccomp::default()))?, None);
        // flags alone do not enable filtering
        let config = LinuxSeccomp {
            flags: vec!["SECCOMP_FILTER_FLAG_LOG".to_owned()],
            ..Default::default()
        };
        assert_eq!(setup_seccomp(Some(&config))?, None);
        Ok(())
    }

    #[test]
    fn test_flags_rejected() {
        let config = LinuxSeccomp {
            default_action: "SCMP_ACT_ALLOW".to_owned(),
            flags: vec!["SECCOMP_FILTER_FLAG_LOG".to_owned()],
            ..Default::default()
        };
        assert!(matches!(
            setup_seccomp(Some(&config)),
            Err(ValidationError::UnsupportedSeccompFlags(_))
        ));
    }

    #[test]
    fn test_unknown_symbols() {
        let config = LinuxSeccomp {
            default_action: "SCMP_ACT_BOGUS".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            setup_seccomp(Some(&config)),
            Err(ValidationError::UnknownSeccompAction(
                "SCMP_ACT_BOGUS".to_owned()
            ))
        );

        let config = LinuxSeccomp {
            default_action: "SCMP_ACT_ALLOW".to_owned(),
            architectures: vec!["SCMP_ARCH_Z80".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            setup_seccomp(Some(&config)),
            Err(ValidationError::UnknownSeccompArch("SCMP_ARCH_Z80".to_owned()))
        );

        let config = LinuxSeccomp {
            default_action: "SCMP_ACT_ALLOW".to_owned(),
            syscalls: vec![LinuxSyscall {
                names: vec!["personality".to_owned()],
                action: "SCMP_ACT_ERRNO".to_owned(),
                args: vec![LinuxSeccompArg {
                    op: "SCMP_CMP_SOMETIMES".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            setup_seccomp(Some(&config)),
            Err(ValidationError::UnknownSeccompOperator(
                "SCMP_CMP_SOMETIMES".to_owned()
            ))
        );
    }

    #[test]
    fn test_names_fan_out() -> Result<()> {
        let config = LinuxSeccomp {
            default_action: "SCMP_ACT_ERRNO".to_owned(),
            default_errno_ret: Some(1),
            architectures: vec!["SCMP_ARCH_X86_64".to_owned(), "SCMP_ARCH_AARCH64".to_owned()],
            flags: vec![],
            syscalls: vec![
                LinuxSyscall {
                    names: vec!["read".to_owned(), "write".to_owned()],
                    action: "SCMP_ACT_ALLOW".to_owned(),
                    errno_ret: None,
                    args: vec![LinuxSeccompArg {
                        index: 0,
                        value: 2,
                        value_two: 0,
                        op: "SCMP_CMP_LE".to_owned(),
                    }],
                },
                LinuxSyscall {
                    names: vec!["close".to_owned()],
                    action: "SCMP_ACT_LOG".to_owned(),
                    errno_ret: Some(38),
                    args: vec![],
                },
            ],
        };
        let seccomp = setup_seccomp(Some(&config))?.expect("seccomp enabled");

        assert_eq!(seccomp.default_action, Action::Errno);
        assert_eq!(seccomp.default_errno_ret, Some(1));
        assert_eq!(seccomp.architectures, vec!["amd64", "arm64"]);

        let names: Vec<&str> = seccomp.syscalls.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["read", "write", "close"]);
        assert_eq!(seccomp.syscalls[0].action, seccomp.syscalls[1].action);
        assert_eq!(seccomp.syscalls[0].args, seccomp.syscalls[1].args);
        assert_eq!(seccomp.syscalls[1].args[0].op, Operator::LessThanOrEqualTo);
        assert_eq!(seccomp.syscalls[2].errno_ret, Some(38));
        Ok(())
    }

    #[test]
    fn test_enum_discriminants() {
        assert_eq!(Action::Kill as i32, 1);
        assert_eq!(Action::Log as i32, 6);
        assert_eq!(Operator::EqualTo as i32, 1);
        assert_eq!(Operator::MaskEqualTo as i32, 7);
    }
}
