use crate::config::DEFAULT_AUTHORITY_ADDR;
use crate::storage::{AccessDecision, ClinicalFields};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Clinical content of a record as given on the command line
#[derive(Debug, Clone, Args)]
pub struct RecordArgs {
    #[arg(long, help = "Department handling the visit")]
    pub department: String,
    #[arg(long = "doctor", help = "Attending doctor")]
    pub doctor_name: String,
    #[arg(long, default_value = "", help = "Reported symptoms")]
    pub symptoms: String,
    #[arg(long, help = "Diagnosis")]
    pub diagnosis: String,
    #[arg(long, default_value = "", help = "Treatment given")]
    pub treatment: String,
    #[arg(long, default_value = "", help = "Free-text notes")]
    pub notes: String,
}

impl From<RecordArgs> for ClinicalFields {
    fn from(args: RecordArgs) -> Self {
        ClinicalFields {
            department: args.department,
            doctor_name: args.doctor_name,
            symptoms: args.symptoms,
            diagnosis: args.diagnosis,
            treatment: args.treatment,
            notes: args.notes,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "medchain", about = "Multi-hospital medical record ledger")]
pub struct Opt {
    #[arg(long, global = true, help = "Path to a TOML settings file")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "init", about = "Create the node database and genesis block")]
    Init,
    #[command(name = "register-hospital", about = "Register a hospital and its password")]
    RegisterHospital {
        #[arg(help = "Hospital identifier")]
        hospital_id: String,
        #[arg(help = "Display name")]
        name: String,
        #[arg(long, help = "Login password (at least 8 characters)")]
        password: String,
    },
    #[command(name = "login", about = "Log in and print a session token")]
    Login {
        #[arg(help = "Hospital identifier")]
        hospital_id: String,
        #[arg(long, help = "Login password")]
        password: String,
    },
    #[command(name = "logout", about = "Close the session behind a token")]
    Logout {
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "create-record", about = "Create a record for a patient")]
    CreateRecord {
        #[arg(long, help = "Session token")]
        token: String,
        #[arg(long, help = "Patient national ID (only its pseudonymous UID is stored)")]
        national_id: String,
        #[command(flatten)]
        fields: RecordArgs,
    },
    #[command(name = "read-record", about = "Read and decrypt a record")]
    ReadRecord {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "update-record", about = "Replace the clinical content of an owned record")]
    UpdateRecord {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Session token")]
        token: String,
        #[command(flatten)]
        fields: RecordArgs,
    },
    #[command(name = "delete-record", about = "Soft-delete an owned record")]
    DeleteRecord {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "request-access", about = "Ask the owning hospital for read access")]
    RequestAccess {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Session token")]
        token: String,
        #[arg(long, help = "Why access is needed")]
        reason: String,
    },
    #[command(name = "respond-access", about = "Grant or deny a pending access request")]
    RespondAccess {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(help = "Requesting hospital")]
        requester: String,
        #[arg(help = "Decision: grant or deny")]
        decision: AccessDecision,
        #[arg(long, help = "Session token of the owning hospital")]
        token: String,
    },
    #[command(name = "revoke-access", about = "Revoke another hospital's access")]
    RevokeAccess {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(help = "Hospital to revoke")]
        hospital_id: String,
        #[arg(long, help = "Session token of the owning hospital")]
        token: String,
    },
    #[command(name = "pending-requests", about = "List access requests awaiting a decision")]
    PendingRequests {
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "verify-record", about = "Check a hash against the anchored record hash")]
    VerifyRecord {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Candidate data hash")]
        hash: String,
        #[arg(long, help = "Also compare against the public anchor")]
        cross_check: bool,
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "audit-history", about = "Print the version history of a record")]
    AuditHistory {
        #[arg(help = "Record ID")]
        record_id: String,
        #[arg(long, help = "Session token")]
        token: String,
    },
    #[command(name = "verify-chain", about = "Verify the whole local ledger")]
    VerifyChain,
    #[command(name = "print-chain", about = "Print all blocks in the ledger")]
    PrintChain,
    #[command(name = "retry-anchors", about = "Retry every pending public anchor now")]
    RetryAnchors,
    #[command(name = "patient-uid", about = "Print the pseudonymous UID for a national ID")]
    PatientUid {
        #[arg(help = "Patient national ID")]
        national_id: String,
    },
    #[command(name = "serve-authority", about = "Run a ledger and public anchor authority")]
    ServeAuthority {
        #[arg(long, default_value = DEFAULT_AUTHORITY_ADDR, help = "Address to listen on")]
        addr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Opt::command().debug_assert();
    }

    #[test]
    fn test_parse_create_record() {
        let opt = Opt::try_parse_from([
            "medchain",
            "--config",
            "node.toml",
            "create-record",
            "--token",
            "t",
            "--national-id",
            "3174",
            "--department",
            "ER",
            "--doctor",
            "dr. Budi",
            "--diagnosis",
            "dengue",
        ])
        .unwrap();

        assert_eq!(opt.config, Some(PathBuf::from("node.toml")));
        match opt.command {
            Command::CreateRecord { fields, .. } => {
                let fields = ClinicalFields::from(fields);
                assert_eq!(fields.diagnosis, "dengue");
                assert_eq!(fields.notes, "");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_decision() {
        let opt = Opt::try_parse_from([
            "medchain",
            "respond-access",
            "rec-1",
            "RS-B",
            "grant",
            "--token",
            "t",
        ])
        .unwrap();
        assert!(matches!(
            opt.command,
            Command::RespondAccess {
                decision: AccessDecision::Grant,
                ..
            }
        ));
        assert!(Opt::try_parse_from(["medchain", "respond-access", "r", "h", "maybe", "--token", "t"]).is_err());
    }
}
