//! Launch orchestration.
//!
//! Launching a title may require reloading the whole service into a
//! different IOS version first. The orchestrator never performs the reload
//! itself; it returns a disposition and the owner tears the service down.
//! The pending title survives the reload in the shared state and the
//! orchestrator runs again with `skip_reload` set once the new instance
//! initializes.

use thiserror::Error;
use tracing::{error, info};

use crate::context::{TitleChangeSink, TitleContext};
use crate::error::Error as EsError;
use crate::formats::{
    is_title_type, TitleType, MIOS_VERSION, TITLE_ID_BC, TITLE_ID_SYSTEM_MENU,
};
use crate::loader::ContentManager;
use crate::nand::NandRoot;

/// What the caller must do after a successful launch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchDisposition {
    /// The title context was updated and the title bootstrapped in place.
    Bootstrapped,
    /// The service itself must be torn down and recreated as this IOS
    /// title. The caller must not touch pre-call state afterwards.
    ReloadIos(u64),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The launch target has no usable install at all. Fatal for the guest
    /// session; the guest will hang or misbehave after this.
    #[error("title {0:016x} is missing from storage or has no usable ticket")]
    MissingFromNand(u64),

    #[error(transparent)]
    Other(#[from] EsError),
}

/// The mutable state slices a launch operates on.
pub struct LaunchContext<'a> {
    pub title_context: &'a mut TitleContext,
    pub content_manager: &'a mut ContentManager,
    pub sink: &'a mut dyn TitleChangeSink,
    pub pending_launch: &'a mut Option<u64>,
}

pub fn launch_title(
    ctx: LaunchContext<'_>,
    title_id: u64,
    skip_reload: bool,
) -> Result<LaunchDisposition, LaunchError> {
    info!("Launching {:016x} (skip_reload = {skip_reload})", title_id);

    // The outgoing title is gone either way; collaborators hear about it.
    ctx.title_context.clear();
    ctx.sink.on_title_change(ctx.title_context);
    ctx.content_manager.clear_cache();

    // System titles other than the system menu are IOS versions; launching
    // one means becoming it.
    if is_title_type(title_id, TitleType::System) && title_id != TITLE_ID_SYSTEM_MENU {
        return Ok(LaunchDisposition::ReloadIos(title_id));
    }

    let loader = ctx.content_manager.get(title_id, false);
    if !loader.is_valid() || !loader.ticket().is_valid() {
        error!("Launch target {:016x} is not installed", title_id);
        return Err(LaunchError::MissingFromNand(title_id));
    }
    let tmd = loader.tmd().clone();
    let ticket = loader.ticket().clone();

    if !skip_reload {
        // First pass: remember the title and become the IOS it asks for.
        // The second pass happens from the new instance's init.
        *ctx.pending_launch = Some(title_id);
        return Ok(LaunchDisposition::ReloadIos(tmd.ios_id()));
    }

    ctx.title_context.update(tmd, ticket, ctx.sink);
    info!("Bootstrapping {:016x}", title_id);
    Ok(LaunchDisposition::Bootstrapped)
}

/// Launch the GameCube compatibility launcher. Refused while already
/// running in compatibility mode.
pub fn launch_bc(
    ctx: LaunchContext<'_>,
    running_ios_version: u32,
) -> Result<LaunchDisposition, LaunchError> {
    if running_ios_version == MIOS_VERSION {
        return Err(LaunchError::Other(EsError::Parameter));
    }
    launch_title(ctx, TITLE_ID_BC, false)
}

/// Make a disc title the running title: record it in the known-titles
/// index, persist its metadata if absent, and activate the context.
pub fn di_verify(
    nand: &NandRoot,
    title_context: &mut TitleContext,
    sink: &mut dyn TitleChangeSink,
    tmd: crate::formats::TmdReader,
    ticket: crate::formats::TicketReader,
) -> Result<(), EsError> {
    if !tmd.is_valid() {
        return Err(EsError::InvalidTmd);
    }
    if !ticket.is_valid() {
        return Err(EsError::InvalidTicket);
    }
    nand.uid_sys().add_title(tmd.title_id())?;
    if !nand.tmd_path(tmd.title_id()).exists() {
        nand.write_tmd(&tmd)?;
    }
    title_context.update(tmd, ticket, sink);
    Ok(())
}
