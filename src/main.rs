// Entry point for the medchain CLI. Every command opens the node described
// by the settings, does one thing, and shuts the node down again.
use clap::Parser;
use log::{error, LevelFilter};
use medchain_ledger::{
    AuthorityServer, Command, LedgerError, MedicalNode, Opt, PublicAnchorStatus, Settings,
};
use std::process;

fn main() {
    // Info level by default; RUST_LOG still overrides it
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(opt.config.as_deref())?;

    // The authority does not need a hospital node, only its own database
    if let Command::ServeAuthority { addr } = &opt.command {
        let path = settings.node.data_dir.join("authority");
        let db = sled::open(&path).map_err(|e| {
            LedgerError::Database(format!("Failed to open {}: {e}", path.display()))
        })?;
        let server = AuthorityServer::with_mock_backends(addr, &db)?;
        println!("Authority listening on {}", server.local_addr()?);
        server.run()?;
        return Ok(());
    }

    // One command per process: without a retry worker the public anchor is
    // attempted inline, and anything left pending waits for `retry-anchors`
    let node = MedicalNode::open(settings)?;
    let result = run_command(&node, opt.command);
    node.shutdown()?;
    result
}

fn run_command(node: &MedicalNode, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let service = node.service();
    match command {
        Command::Init => {
            let genesis = service
                .ledger()
                .get_block(0)?
                .ok_or("ledger has no genesis block")?;
            println!("Node {} ready", node.settings().node.node_id);
            println!("Genesis hash: {}", genesis.get_hash());
            println!("Blocks: {}", service.ledger().len()?);
        }
        Command::RegisterHospital {
            hospital_id,
            name,
            password,
        } => {
            node.auth().register_hospital(&hospital_id, &name, &password)?;
            println!("Registered {hospital_id} ({name})");
        }
        Command::Login {
            hospital_id,
            password,
        } => {
            let token = node.auth().login(&hospital_id, &password)?;
            println!("{token}");
        }
        Command::Logout { token } => {
            node.auth().logout(&token)?;
            println!("Logged out");
        }
        Command::CreateRecord {
            token,
            national_id,
            fields,
        } => {
            let identity = node.authenticate(&token)?;
            let patient_uid = node.patient_uid(&national_id)?;
            let created =
                service.create_record(&patient_uid, &identity.hospital_id, &fields.into())?;
            println!("Record ID: {}", created.record_id);
            println!("Data hash: {}", created.data_hash);
            println!("Ledger tx: {}", created.ledger_tx_ref);
            println!("Block: {}", created.block_index);
            println!("Public anchor: {}", created.anchor_status);
        }
        Command::ReadRecord { record_id, token } => {
            let identity = node.authenticate(&token)?;
            let view = service.read_record(&record_id, &identity.hospital_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::UpdateRecord {
            record_id,
            token,
            fields,
        } => {
            let identity = node.authenticate(&token)?;
            let updated =
                service.update_record(&record_id, &identity.hospital_id, &fields.into())?;
            println!("Version: {}", updated.version);
            println!("Data hash: {}", updated.data_hash);
            println!("Ledger tx: {}", updated.ledger_tx_ref);
            println!("Public anchor: {}", updated.anchor_status);
        }
        Command::DeleteRecord { record_id, token } => {
            let identity = node.authenticate(&token)?;
            let deleted = service.delete_record(&record_id, &identity.hospital_id)?;
            println!("Deleted at: {}", deleted.deleted_at);
            println!("Ledger tx: {}", deleted.ledger_tx_ref);
        }
        Command::RequestAccess {
            record_id,
            token,
            reason,
        } => {
            let identity = node.authenticate(&token)?;
            let outcome = service.request_access(&record_id, &identity.hospital_id, &reason)?;
            println!("Request {} is {}", outcome.request_id, outcome.status);
        }
        Command::RespondAccess {
            record_id,
            requester,
            decision,
            token,
        } => {
            let identity = node.authenticate(&token)?;
            let state = service.respond_to_access_request(
                &record_id,
                &requester,
                &identity.hospital_id,
                decision,
            )?;
            println!("{requester} is now {state:?} on {record_id}");
        }
        Command::RevokeAccess {
            record_id,
            hospital_id,
            token,
        } => {
            let identity = node.authenticate(&token)?;
            service.revoke_access(&record_id, &hospital_id, &identity.hospital_id)?;
            println!("Revoked {hospital_id} on {record_id}");
        }
        Command::PendingRequests { token } => {
            let identity = node.authenticate(&token)?;
            let pending = service.pending_requests(&identity.hospital_id)?;
            if pending.is_empty() {
                println!("No pending requests");
            }
            for request in pending {
                println!(
                    "{} {} from {}: {}",
                    request.request_id,
                    request.record_id,
                    request.requester_hospital_id,
                    request.reason
                );
            }
        }
        Command::VerifyRecord {
            record_id,
            hash,
            cross_check,
            token,
        } => {
            let identity = node.authenticate(&token)?;
            let report = if cross_check {
                service.cross_check_record(&record_id, &identity.hospital_id, &hash)?
            } else {
                service.verify_record_integrity(&record_id, &identity.hospital_id, &hash)?
            };
            println!("Valid: {}", report.is_valid);
            println!("Checked against: {:?}", report.checked_against);
        }
        Command::AuditHistory { record_id, token } => {
            let identity = node.authenticate(&token)?;
            let history = service.audit_history(&record_id, &identity.hospital_id)?;
            for entry in &history {
                let entry = entry?;
                let public = entry
                    .anchor
                    .as_ref()
                    .map(|a| a.public.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "v{} {:?} at {} hash={} ledger_tx={} public={}",
                    entry.version,
                    entry.event,
                    entry.timestamp,
                    entry.data_hash,
                    entry.ledger_tx_ref,
                    public
                );
            }
        }
        Command::VerifyChain => {
            let blocks = service.verify_chain()?;
            println!("Ledger verified: {blocks} blocks");
        }
        Command::PrintChain => {
            for block in service.ledger().blocks() {
                let block = block?;
                let data = block.get_data();
                println!("Index: {}", block.get_index());
                println!("Prev hash: {}", block.get_previous_hash());
                println!("Hash: {}", block.get_hash());
                println!("Timestamp: {}", block.get_timestamp());
                println!("Nonce: {}", block.get_nonce());
                println!(
                    "- {} {} v{} by {} data_hash={}",
                    data.operation, data.record_id, data.version, data.hospital_id, data.data_hash
                );
                if !service.is_committed_block(&block)? {
                    println!("- orphan: change was not committed");
                }
                println!();
            }
        }
        Command::RetryAnchors => {
            let outcomes = service.retry_pending_anchors()?;
            if outcomes.is_empty() {
                println!("No pending anchors");
            }
            for (tx_ref, status) in outcomes {
                let marker = match status {
                    PublicAnchorStatus::Anchored { .. } => "ok",
                    PublicAnchorStatus::PendingPublicAnchor { .. } => "pending",
                    PublicAnchorStatus::AnchorFailed { .. } => "FAILED",
                };
                println!("{tx_ref}: {status} [{marker}]");
            }
        }
        Command::PatientUid { national_id } => {
            println!("{}", node.patient_uid(&national_id)?);
        }
        Command::ServeAuthority { .. } => {
            return Err("serve-authority does not run inside a node".into());
        }
    }
    Ok(())
}
